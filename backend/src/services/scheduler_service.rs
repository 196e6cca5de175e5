//! Background task scheduler.
//!
//! Periodically dispatches the inspection cluster scale-up and the results
//! collection tasks, and refreshes database pool gauges.

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

use crate::config::Config;
use crate::services::metrics_service;
use crate::services::task_worker::{Task, TaskDispatcher};

/// Dispatch `task` every `period`, starting after `initial_delay`.
fn spawn_periodic(
    dispatcher: TaskDispatcher,
    task: Task,
    initial_delay: Duration,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(initial_delay).await;
        let mut ticker = interval(period);

        loop {
            ticker.tick().await;
            tracing::debug!(task = task.name(), "Dispatching scheduled task");
            if let Err(e) = dispatcher.dispatch(&task).await {
                tracing::warn!(task = task.name(), error = %e, "Failed to dispatch scheduled task");
            }
        }
    })
}

/// Spawn all background scheduler tasks.
pub fn spawn_all(db: PgPool, dispatcher: TaskDispatcher, config: &Config) -> Vec<JoinHandle<()>> {
    let mut handles = vec![
        spawn_periodic(
            dispatcher.clone(),
            Task::ScaleUpInspectionCluster,
            Duration::from_secs(30),
            Duration::from_secs(config.scale_up_inspection_cluster_schedule_secs.max(1)),
        ),
        spawn_periodic(
            dispatcher,
            Task::PersistInspectionClusterResults,
            Duration::from_secs(45),
            Duration::from_secs(config.persist_inspection_results_schedule_secs.max(1)),
        ),
    ];

    // Pool gauges (every minute)
    handles.push(tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            metrics_service::set_db_pool_gauges(&db);
        }
    }));

    tracing::info!(
        scale_up_secs = config.scale_up_inspection_cluster_schedule_secs,
        persist_results_secs = config.persist_inspection_results_schedule_secs,
        "Background schedulers started"
    );
    handles
}
