//! Application configuration loaded from environment variables.

use crate::cloud::MAX_INSPECTION_DEVICES;
use crate::error::{AppError, Result};
use std::env;
use std::str::FromStr;

/// Which message queue implementation backs the task pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackendKind {
    /// Amazon SQS
    Sqs,
    /// Process-local queues (development and tests)
    Memory,
}

impl FromStr for QueueBackendKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sqs" => Ok(QueueBackendKind::Sqs),
            "memory" => Ok(QueueBackendKind::Memory),
            other => Err(AppError::Config(format!(
                "QUEUE_BACKEND must be 'sqs' or 'memory', got '{}'",
                other
            ))),
        }
    }
}

impl QueueBackendKind {
    /// True when only the process that created the queues can read them.
    pub fn is_process_local(self) -> bool {
        matches!(self, QueueBackendKind::Memory)
    }
}

/// Application configuration
#[derive(Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Server bind address (host:port)
    pub bind_address: String,

    /// Prefix applied to every queue and AWS resource name we create
    pub aws_name_prefix: String,

    /// Queue backend used for tasks and inspection messages
    pub queue_backend: QueueBackendKind,

    /// Region holding our SQS queues
    pub sqs_region: String,

    /// Availability zone where inspection volumes are created
    pub houndigrade_availability_zone: String,

    /// Autoscaling group backing the inspection cluster
    pub houndigrade_autoscaling_group_name: String,

    /// Maximum number of volumes handed to one inspection run
    pub houndigrade_volume_batch_size: usize,

    /// ECS cluster running houndigrade
    pub houndigrade_ecs_cluster_name: String,

    /// ECS task definition family
    pub houndigrade_ecs_family_name: String,

    /// Container image for houndigrade
    pub houndigrade_ecs_image_name: String,

    /// Container image tag for houndigrade
    pub houndigrade_ecs_image_tag: String,

    /// Run houndigrade with debug output
    pub houndigrade_debug: bool,

    /// Exchange name handed to houndigrade for result publishing
    pub houndigrade_exchange_name: String,

    /// Queue houndigrade writes inspection results to
    pub houndigrade_results_queue_name: String,

    /// Seconds between inspection cluster scale-up attempts
    pub scale_up_inspection_cluster_schedule_secs: u64,

    /// Seconds between inspection result collection runs
    pub persist_inspection_results_schedule_secs: u64,

    /// How many times a task may be retried before it is dropped
    pub task_max_retries: u32,

    /// Base delay for task retry backoff, in seconds
    pub task_retry_delay_secs: u64,

    /// OTLP endpoint for span export (optional)
    pub otel_endpoint: Option<String>,
}

redacted_debug!(Config {
    hidden: [database_url],
    shown: [
        bind_address,
        aws_name_prefix,
        queue_backend,
        sqs_region,
        houndigrade_availability_zone,
        houndigrade_autoscaling_group_name,
        houndigrade_volume_batch_size,
        houndigrade_ecs_cluster_name,
        houndigrade_ecs_family_name,
        houndigrade_ecs_image_name,
        houndigrade_ecs_image_tag,
        houndigrade_debug,
        houndigrade_exchange_name,
        houndigrade_results_queue_name,
        scale_up_inspection_cluster_schedule_secs,
        persist_inspection_results_schedule_secs,
        task_max_retries,
        task_retry_delay_secs,
        otel_endpoint,
    ],
});

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(false)
}

/// Each volume in an inspection run needs its own device name.
fn check_volume_batch_size(size: usize) -> Result<()> {
    if size == 0 || size > MAX_INSPECTION_DEVICES {
        return Err(AppError::Config(format!(
            "HOUNDIGRADE_AWS_VOLUME_BATCH_SIZE must be between 1 and {}, got {}",
            MAX_INSPECTION_DEVICES, size
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let aws_name_prefix = env::var("AWS_NAME_PREFIX")
            .unwrap_or_else(|_| format!("{}-", env_or("USER", "anonymous")));

        let houndigrade_results_queue_name = env::var("HOUNDIGRADE_RESULTS_QUEUE_NAME")
            .unwrap_or_else(|_| format!("{}inspection_results", aws_name_prefix));

        let sqs_region = env::var("AWS_SQS_REGION")
            .or_else(|_| env::var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|_| "us-east-1".into());

        let houndigrade_volume_batch_size = env_parse("HOUNDIGRADE_AWS_VOLUME_BATCH_SIZE", 32);
        check_volume_batch_size(houndigrade_volume_batch_size)?;

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL not set".into()))?,
            bind_address: env_or("BIND_ADDRESS", "0.0.0.0:8080"),
            aws_name_prefix,
            queue_backend: env_or("QUEUE_BACKEND", "sqs").parse()?,
            sqs_region,
            houndigrade_availability_zone: env_or(
                "HOUNDIGRADE_AWS_AVAILABILITY_ZONE",
                "us-east-1b",
            ),
            houndigrade_autoscaling_group_name: env_or(
                "HOUNDIGRADE_AWS_AUTOSCALING_GROUP_NAME",
                "cloudigrade-inspection-asg",
            ),
            houndigrade_volume_batch_size,
            houndigrade_ecs_cluster_name: env_or(
                "HOUNDIGRADE_ECS_CLUSTER_NAME",
                "cloudigrade-inspection",
            ),
            houndigrade_ecs_family_name: env_or("HOUNDIGRADE_ECS_FAMILY_NAME", "Houndigrade"),
            houndigrade_ecs_image_name: env_or(
                "HOUNDIGRADE_ECS_IMAGE_NAME",
                "cloudigrade/houndigrade",
            ),
            houndigrade_ecs_image_tag: env_or("HOUNDIGRADE_ECS_IMAGE_TAG", "latest"),
            houndigrade_debug: env_bool("HOUNDIGRADE_DEBUG"),
            houndigrade_exchange_name: env_or("HOUNDIGRADE_EXCHANGE_NAME", ""),
            houndigrade_results_queue_name,
            scale_up_inspection_cluster_schedule_secs: env_parse(
                "SCALE_UP_INSPECTION_CLUSTER_SCHEDULE",
                60 * 60,
            ),
            persist_inspection_results_schedule_secs: env_parse(
                "PERSIST_INSPECTION_RESULTS_SCHEDULE",
                60 * 60,
            ),
            task_max_retries: env_parse("TASK_MAX_RETRIES", 5),
            task_retry_delay_secs: env_parse("TASK_RETRY_DELAY_SECS", 30),
            otel_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        })
    }

    /// Fail unless tasks sent by one process can be consumed by another.
    pub fn require_shared_queue(&self) -> Result<()> {
        if self.queue_backend.is_process_local() {
            return Err(AppError::Config(
                "QUEUE_BACKEND=memory cannot feed a separate worker; `serve` runs the task workers itself"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Region of the inspection availability zone.
    pub fn houndigrade_region(&self) -> &str {
        crate::cloud::get_region_from_availability_zone(&self.houndigrade_availability_zone)
    }

    /// Fully-qualified name of a queue owned by this deployment.
    pub fn queue_name(&self, name: &str) -> String {
        format!("{}{}", self.aws_name_prefix, name)
    }

    /// Name of the queue holding volumes ready for inspection.
    pub fn ready_volumes_queue_name(&self) -> String {
        self.queue_name("ready_volumes")
    }

    /// Configuration suitable for tests: memory queues and a fixed prefix.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            database_url: "postgres://localhost/cloudigrade_test".into(),
            bind_address: "127.0.0.1:0".into(),
            aws_name_prefix: "test-".into(),
            queue_backend: QueueBackendKind::Memory,
            sqs_region: "us-east-1".into(),
            houndigrade_availability_zone: "us-east-1b".into(),
            houndigrade_autoscaling_group_name: "test-asg".into(),
            houndigrade_volume_batch_size: 32,
            houndigrade_ecs_cluster_name: "test-cluster".into(),
            houndigrade_ecs_family_name: "Houndigrade".into(),
            houndigrade_ecs_image_name: "cloudigrade/houndigrade".into(),
            houndigrade_ecs_image_tag: "latest".into(),
            houndigrade_debug: false,
            houndigrade_exchange_name: String::new(),
            houndigrade_results_queue_name: "test-inspection_results".into(),
            scale_up_inspection_cluster_schedule_secs: 3600,
            persist_inspection_results_schedule_secs: 3600,
            task_max_retries: 3,
            task_retry_delay_secs: 1,
            otel_endpoint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_backend_parse() {
        assert_eq!(
            "SQS".parse::<QueueBackendKind>().unwrap(),
            QueueBackendKind::Sqs
        );
        assert_eq!(
            "memory".parse::<QueueBackendKind>().unwrap(),
            QueueBackendKind::Memory
        );
        assert!("rabbit".parse::<QueueBackendKind>().is_err());
    }

    #[test]
    fn test_queue_names_are_prefixed() {
        let config = Config::for_tests();
        assert_eq!(config.queue_name("create_volume"), "test-create_volume");
        assert_eq!(config.ready_volumes_queue_name(), "test-ready_volumes");
    }

    #[test]
    fn test_houndigrade_region_strips_zone_letter() {
        let config = Config::for_tests();
        assert_eq!(config.houndigrade_region(), "us-east-1");
    }

    #[test]
    fn test_debug_redacts_database_url() {
        let mut config = Config::for_tests();
        config.database_url = "postgres://user:hunter2@db/cloudigrade".into();
        let output = format!("{:?}", config);
        assert!(!output.contains("hunter2"));
        assert!(output.contains("database_url: \"[REDACTED]\""));
        assert!(output.contains("aws_name_prefix: \"test-\""));
        assert!(output.contains("houndigrade_volume_batch_size: 32"));
    }

    #[test]
    fn test_volume_batch_size_bounds() {
        assert!(check_volume_batch_size(1).is_ok());
        assert!(check_volume_batch_size(MAX_INSPECTION_DEVICES).is_ok());
        assert!(check_volume_batch_size(0).is_err());
        assert!(check_volume_batch_size(MAX_INSPECTION_DEVICES + 1).is_err());
        assert!(check_volume_batch_size(10_000).is_err());
    }

    #[test]
    fn test_memory_queue_cannot_feed_separate_worker() {
        let mut config = Config::for_tests();
        assert!(config.queue_backend.is_process_local());
        assert!(matches!(
            config.require_shared_queue(),
            Err(AppError::Config(_))
        ));

        config.queue_backend = QueueBackendKind::Sqs;
        assert!(!config.queue_backend.is_process_local());
        assert!(config.require_shared_queue().is_ok());
    }
}
