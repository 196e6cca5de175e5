//! Asynchronous task messages, dispatch and the worker loop.
//!
//! A task travels as `{"task": <name>, "args": {...}, "retries": n}` on the
//! queue named `<AWS_NAME_PREFIX><name>`. One worker loop per task queue
//! executes messages in order. A task that asks to be retried is re-sent with
//! an exponential delay until the retry budget runs out.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::cloud::CloudError;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::queue::{MessageQueue, MAX_DELAY};
use crate::services::inspection::InspectionService;
use crate::services::metrics_service;

/// Messages taken from a task queue per poll.
const TASK_BATCH_SIZE: usize = 10;

/// Idle wait between polls of an empty queue.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A volume ready for inspection, as stored on the ready-volumes queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyVolume {
    pub ami_id: String,
    pub volume_id: String,
}

/// Every unit of work the pipeline performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", content = "args", rename_all = "snake_case")]
pub enum Task {
    CopyAmiSnapshot {
        arn: String,
        ami_id: String,
        region: String,
        #[serde(default)]
        reference_ami_id: Option<String>,
    },
    CopyAmiToCustomerAccount {
        arn: String,
        reference_ami_id: String,
        region: String,
        #[serde(default)]
        maybe_marketplace: bool,
    },
    RemoveSnapshotOwnership {
        arn: String,
        customer_snapshot_id: String,
        region: String,
        snapshot_copy_id: String,
    },
    CreateVolume {
        ami_id: String,
        snapshot_id: String,
    },
    EnqueueReadyVolume {
        ami_id: String,
        volume_id: String,
        region: String,
    },
    DeleteSnapshot {
        snapshot_copy_id: String,
        volume_id: String,
        volume_region: String,
    },
    ScaleUpInspectionCluster,
    RunInspectionCluster {
        messages: Vec<ReadyVolume>,
    },
    PersistInspectionClusterResults,
    ScaleDownCluster,
}

impl Task {
    /// Names of all tasks, one queue each.
    pub const NAMES: &'static [&'static str] = &[
        "copy_ami_snapshot",
        "copy_ami_to_customer_account",
        "remove_snapshot_ownership",
        "create_volume",
        "enqueue_ready_volume",
        "delete_snapshot",
        "scale_up_inspection_cluster",
        "run_inspection_cluster",
        "persist_inspection_cluster_results",
        "scale_down_cluster",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Task::CopyAmiSnapshot { .. } => "copy_ami_snapshot",
            Task::CopyAmiToCustomerAccount { .. } => "copy_ami_to_customer_account",
            Task::RemoveSnapshotOwnership { .. } => "remove_snapshot_ownership",
            Task::CreateVolume { .. } => "create_volume",
            Task::EnqueueReadyVolume { .. } => "enqueue_ready_volume",
            Task::DeleteSnapshot { .. } => "delete_snapshot",
            Task::ScaleUpInspectionCluster => "scale_up_inspection_cluster",
            Task::RunInspectionCluster { .. } => "run_inspection_cluster",
            Task::PersistInspectionClusterResults => "persist_inspection_cluster_results",
            Task::ScaleDownCluster => "scale_down_cluster",
        }
    }

    /// Serialize with the given retry count.
    pub fn encode(&self, retries: u32) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.insert("retries".to_string(), retries.into());
        }
        Ok(value.to_string())
    }

    /// Parse a message body into the task and its retry count.
    pub fn decode(body: &str) -> Result<(Task, u32)> {
        let mut value: serde_json::Value = serde_json::from_str(body)?;
        let retries = value
            .as_object_mut()
            .and_then(|object| object.remove("retries"))
            .and_then(|r| r.as_u64())
            .map_or(0, |r| u32::try_from(r).unwrap_or(u32::MAX));
        Ok((serde_json::from_value(value)?, retries))
    }
}

/// Why a task did not complete.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Transient condition; run the task again later.
    #[error("retry: {0}")]
    Retry(String),

    /// Permanent failure; the task is dropped.
    #[error("{0}")]
    Fail(String),
}

impl From<AppError> for TaskError {
    fn from(e: AppError) -> Self {
        TaskError::Fail(e.to_string())
    }
}

impl From<CloudError> for TaskError {
    fn from(e: CloudError) -> Self {
        TaskError::Fail(e.to_string())
    }
}

/// Delay before retry number `retries + 1`.
pub fn retry_backoff(base_secs: u64, retries: u32) -> Duration {
    let factor = 1u64.checked_shl(retries).unwrap_or(u64::MAX);
    Duration::from_secs(base_secs.saturating_mul(factor)).min(MAX_DELAY)
}

/// Sends tasks to their queues.
#[derive(Clone)]
pub struct TaskDispatcher {
    queue: Arc<dyn MessageQueue>,
    prefix: String,
}

impl TaskDispatcher {
    pub fn new(queue: Arc<dyn MessageQueue>, prefix: &str) -> Self {
        Self {
            queue,
            prefix: prefix.to_string(),
        }
    }

    pub fn queue_name(&self, task_name: &str) -> String {
        format!("{}{}", self.prefix, task_name)
    }

    pub async fn dispatch(&self, task: &Task) -> Result<()> {
        self.send(task, 0, Duration::ZERO).await
    }

    pub async fn send(&self, task: &Task, retries: u32, delay: Duration) -> Result<()> {
        let body = task.encode(retries)?;
        tracing::debug!(task = task.name(), retries, delay_secs = delay.as_secs(), "Dispatching task");
        self.queue.send(&self.queue_name(task.name()), &body, delay).await
    }
}

/// What happened to one task message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Retried { retries: u32, delay: Duration },
    Dropped,
    Failed,
    Invalid,
}

impl TaskOutcome {
    fn label(self) -> &'static str {
        match self {
            TaskOutcome::Succeeded => "succeeded",
            TaskOutcome::Retried { .. } => "retried",
            TaskOutcome::Dropped => "dropped",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Invalid => "invalid",
        }
    }
}

/// Pulls task messages off their queues and executes them.
pub struct TaskWorker {
    inspection: Arc<InspectionService>,
    queue: Arc<dyn MessageQueue>,
    dispatcher: TaskDispatcher,
    max_retries: u32,
    retry_delay_secs: u64,
}

impl TaskWorker {
    pub fn new(
        inspection: Arc<InspectionService>,
        queue: Arc<dyn MessageQueue>,
        config: &Config,
    ) -> Self {
        Self {
            inspection,
            dispatcher: TaskDispatcher::new(queue.clone(), &config.aws_name_prefix),
            queue,
            max_retries: config.task_max_retries,
            retry_delay_secs: config.task_retry_delay_secs,
        }
    }

    /// Spawn one polling loop per task queue.
    pub fn spawn_all(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        Task::NAMES
            .iter()
            .map(|name| {
                let worker = self.clone();
                let queue_name = worker.dispatcher.queue_name(name);
                tokio::spawn(async move { worker.run_queue(queue_name).await })
            })
            .collect()
    }

    async fn run_queue(&self, queue_name: String) {
        tracing::info!(queue = %queue_name, "Task worker started");
        loop {
            match self.queue.receive(&queue_name, TASK_BATCH_SIZE).await {
                Ok(bodies) if bodies.is_empty() => tokio::time::sleep(POLL_INTERVAL).await,
                Ok(bodies) => {
                    for body in bodies {
                        self.process_message(&body).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(queue = %queue_name, error = %e, "Failed to read task queue");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Execute one message and handle retry bookkeeping.
    pub async fn process_message(&self, body: &str) -> TaskOutcome {
        let (task, retries) = match Task::decode(body) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::error!(error = %e, body = body, "Discarding undecodable task message");
                metrics_service::record_task("unknown", TaskOutcome::Invalid.label(), 0.0);
                return TaskOutcome::Invalid;
            }
        };

        let started = Instant::now();
        let outcome = match self.inspection.execute(&task).await {
            Ok(()) => TaskOutcome::Succeeded,
            Err(TaskError::Retry(reason)) if retries < self.max_retries => {
                let delay = retry_backoff(self.retry_delay_secs, retries);
                tracing::info!(
                    task = task.name(),
                    retries = retries + 1,
                    delay_secs = delay.as_secs(),
                    reason = %reason,
                    "Retrying task"
                );
                match self.dispatcher.send(&task, retries + 1, delay).await {
                    Ok(()) => TaskOutcome::Retried {
                        retries: retries + 1,
                        delay,
                    },
                    Err(e) => {
                        tracing::error!(task = task.name(), error = %e, "Failed to requeue task");
                        TaskOutcome::Failed
                    }
                }
            }
            Err(TaskError::Retry(reason)) => {
                tracing::error!(
                    task = task.name(),
                    retries,
                    reason = %reason,
                    "Task exhausted its retries"
                );
                TaskOutcome::Dropped
            }
            Err(TaskError::Fail(reason)) => {
                tracing::error!(task = task.name(), reason = %reason, "Task failed");
                TaskOutcome::Failed
            }
        };

        metrics_service::record_task(
            task.name(),
            outcome.label(),
            started.elapsed().as_secs_f64(),
        );
        outcome
    }
}
