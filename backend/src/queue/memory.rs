//! Process-local queues.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{MessageQueue, MAX_DELAY};
use crate::error::{AppError, Result};

type Queues = Arc<Mutex<HashMap<String, VecDeque<String>>>>;

/// In-memory [`MessageQueue`]. Clones share the same queues.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    queues: Queues,
}

fn push(queues: &Queues, queue: &str, bodies: impl IntoIterator<Item = String>) -> Result<()> {
    let mut guard = queues
        .lock()
        .map_err(|_| AppError::Queue("memory queue lock poisoned".into()))?;
    guard.entry(queue.to_string()).or_default().extend(bodies);
    Ok(())
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently visible on a queue.
    pub fn len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .map(|q| q.get(queue).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn send(&self, queue: &str, body: &str, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return push(&self.queues, queue, [body.to_string()]);
        }

        let queues = self.queues.clone();
        let queue = queue.to_string();
        let body = body.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay.min(MAX_DELAY)).await;
            if let Err(e) = push(&queues, &queue, [body]) {
                tracing::error!(queue = %queue, error = %e, "Failed to deliver delayed message");
            }
        });
        Ok(())
    }

    async fn send_batch(&self, queue: &str, bodies: &[String]) -> Result<()> {
        push(&self.queues, queue, bodies.iter().cloned())
    }

    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<String>> {
        let mut guard = self
            .queues
            .lock()
            .map_err(|_| AppError::Queue("memory queue lock poisoned".into()))?;
        let Some(pending) = guard.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let take = max.min(pending.len());
        Ok(pending.drain(..take).collect())
    }
}
