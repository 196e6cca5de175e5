//! Prometheus metrics collection and HTTP request instrumentation.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};

use crate::error::{AppError, Result};

/// Initialize the Prometheus metrics recorder and return the handle for rendering.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Internal(format!("failed to install Prometheus recorder: {}", e)))
}

/// Axum middleware that records HTTP request metrics.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = normalize_path(request.uri().path());

    let start = Instant::now();
    counter!("cloudigrade_http_requests_total", "method" => method.clone(), "path" => path.clone())
        .increment(1);
    gauge!("cloudigrade_http_requests_in_flight", "method" => method.clone(), "path" => path.clone())
        .increment(1.0);

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    histogram!("cloudigrade_http_request_duration_seconds", "method" => method.clone(), "path" => path.clone(), "status" => status.clone()).record(duration);
    counter!("cloudigrade_http_responses_total", "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    gauge!("cloudigrade_http_requests_in_flight", "method" => method, "path" => path).decrement(1.0);

    response
}

/// Replace UUIDs and numeric ids in a path with `:id`.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            let is_uuid = seg.len() == 36 && seg.chars().filter(|c| *c == '-').count() == 4;
            let is_numeric = !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit());
            if is_uuid || is_numeric {
                ":id"
            } else {
                seg
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Record the outcome of one pipeline task execution.
pub fn record_task(task: &str, outcome: &str, duration_secs: f64) {
    counter!("cloudigrade_tasks_total", "task" => task.to_string(), "outcome" => outcome.to_string()).increment(1);
    histogram!("cloudigrade_task_duration_seconds", "task" => task.to_string()).record(duration_secs);
}

/// Record a successful account registration.
pub fn record_account_registered(instances: usize, images_queued: usize) {
    counter!("cloudigrade_accounts_registered_total").increment(1);
    counter!("cloudigrade_instances_discovered_total").increment(instances as u64);
    counter!("cloudigrade_images_queued_total").increment(images_queued as u64);
}

/// Record a task that could not be put on its queue.
pub fn record_dispatch_failure(task: &str) {
    counter!("cloudigrade_task_dispatch_failures_total", "task" => task.to_string()).increment(1);
}

/// Record images whose inspection finished.
pub fn record_images_inspected(count: usize, rhel: usize) {
    counter!("cloudigrade_images_inspected_total").increment(count as u64);
    counter!("cloudigrade_images_rhel_total").increment(rhel as u64);
}

/// Update database connection pool gauge metrics.
pub fn set_db_pool_gauges(pool: &sqlx::PgPool) {
    let size = pool.size() as f64;
    let idle = pool.num_idle() as f64;
    gauge!("cloudigrade_db_pool_connections_active").set(size - idle);
    gauge!("cloudigrade_db_pool_connections_idle").set(idle);
    gauge!("cloudigrade_db_pool_connections_max").set(pool.options().get_max_connections() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_uuid() {
        let path = "/api/v1/account/550e8400-e29b-41d4-a716-446655440000/";
        assert_eq!(normalize_path(path), "/api/v1/account/:id/");
    }

    #[test]
    fn test_normalize_path_numeric() {
        assert_eq!(normalize_path("/api/v1/user/123/"), "/api/v1/user/:id/");
    }

    #[test]
    fn test_normalize_path_no_change() {
        assert_eq!(normalize_path("/api/v1/sysconfig/"), "/api/v1/sysconfig/");
    }
}
