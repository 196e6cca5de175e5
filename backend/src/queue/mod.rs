//! Message queue backends.
//!
//! The inspection pipeline moves work between steps as JSON strings on named
//! queues. [`SqsQueue`] is used in deployments and [`MemoryQueue`] for local
//! development and tests.

pub mod memory;
pub mod sqs;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, QueueBackendKind};
use crate::error::Result;

pub use memory::MemoryQueue;
pub use sqs::SqsQueue;

/// Longest delay a queue accepts for a single message.
pub const MAX_DELAY: Duration = Duration::from_secs(15 * 60);

/// Message queue trait
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Send one message, visible after `delay` (clamped to [`MAX_DELAY`]).
    async fn send(&self, queue: &str, body: &str, delay: Duration) -> Result<()>;

    /// Send several messages at once.
    async fn send_batch(&self, queue: &str, bodies: &[String]) -> Result<()>;

    /// Take up to `max` messages. Returned messages are removed from the queue.
    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<String>>;
}

/// Build the queue backend selected in configuration.
pub async fn from_config(config: &Config) -> Arc<dyn MessageQueue> {
    match config.queue_backend {
        QueueBackendKind::Sqs => {
            tracing::info!(region = %config.sqs_region, "Using SQS message queues");
            Arc::new(SqsQueue::new(&config.sqs_region).await)
        }
        QueueBackendKind::Memory => {
            tracing::info!("Using in-memory message queues");
            Arc::new(MemoryQueue::new())
        }
    }
}
