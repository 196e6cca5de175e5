//! API module - HTTP handlers and middleware.

pub mod dto;
pub mod handlers;
pub mod middleware;
pub mod openapi;
pub mod routes;

use crate::cloud::CloudProvider;
use crate::config::Config;
use crate::services::account_service::AccountService;
use crate::services::task_worker::TaskDispatcher;
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: PgPool,
    pub cloud: Arc<dyn CloudProvider>,
    pub dispatcher: TaskDispatcher,
    pub metrics_handle: Option<Arc<PrometheusHandle>>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: PgPool,
        cloud: Arc<dyn CloudProvider>,
        dispatcher: TaskDispatcher,
    ) -> Self {
        Self {
            config,
            db,
            cloud,
            dispatcher,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus metrics handle for rendering /metrics output.
    pub fn set_metrics_handle(&mut self, handle: PrometheusHandle) {
        self.metrics_handle = Some(Arc::new(handle));
    }

    pub fn create_account_service(&self) -> AccountService {
        AccountService::new(self.db.clone(), self.cloud.clone(), self.dispatcher.clone())
    }
}

pub type SharedState = Arc<AppState>;
