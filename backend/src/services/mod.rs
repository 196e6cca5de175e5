//! Business logic services.

pub mod account_service;
pub mod auth_service;
pub mod inspection;
pub mod inventory_service;
pub mod metrics_service;
pub mod report_service;
pub mod scheduler_service;
pub mod task_worker;
