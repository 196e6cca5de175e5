//! Amazon SQS backend.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::error::ProvideErrorMetadata;
use aws_sdk_sqs::types::{DeleteMessageBatchRequestEntry, SendMessageBatchRequestEntry};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{MessageQueue, MAX_DELAY};
use crate::error::{AppError, Result};

/// SQS accepts at most this many entries per batch call or receive.
const SQS_BATCH_LIMIT: usize = 10;

/// Long-poll wait per receive request, in seconds.
const RECEIVE_WAIT_SECS: i32 = 1;

/// SQS-backed [`MessageQueue`]. Queues are created on first use.
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    urls: RwLock<HashMap<String, String>>,
}

fn queue_error<E: ProvideErrorMetadata + std::fmt::Debug>(queue: &str, err: E) -> AppError {
    AppError::Queue(format!(
        "{}: {} {}",
        queue,
        err.code().unwrap_or("Unknown"),
        err.message().map(str::to_string).unwrap_or_else(|| format!("{:?}", err))
    ))
}

impl SqsQueue {
    pub async fn new(region: &str) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: aws_sdk_sqs::Client::new(&sdk_config),
            urls: RwLock::new(HashMap::new()),
        }
    }

    async fn queue_url(&self, queue: &str) -> Result<String> {
        if let Some(url) = self.urls.read().await.get(queue) {
            return Ok(url.clone());
        }

        let url = match self.client.get_queue_url().queue_name(queue).send().await {
            Ok(output) => output.queue_url().map(str::to_string),
            Err(e) if e.code() == Some("AWS.SimpleQueueService.NonExistentQueue") => {
                tracing::info!(queue = queue, "Creating SQS queue");
                self.client
                    .create_queue()
                    .queue_name(queue)
                    .send()
                    .await
                    .map_err(|e| queue_error(queue, e))?
                    .queue_url()
                    .map(str::to_string)
            }
            Err(e) => return Err(queue_error(queue, e)),
        }
        .ok_or_else(|| AppError::Queue(format!("{}: no queue url returned", queue)))?;

        self.urls.write().await.insert(queue.to_string(), url.clone());
        Ok(url)
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn send(&self, queue: &str, body: &str, delay: Duration) -> Result<()> {
        let url = self.queue_url(queue).await?;
        self.client
            .send_message()
            .queue_url(url)
            .message_body(body)
            .delay_seconds(delay.min(MAX_DELAY).as_secs() as i32)
            .send()
            .await
            .map_err(|e| queue_error(queue, e))?;
        Ok(())
    }

    async fn send_batch(&self, queue: &str, bodies: &[String]) -> Result<()> {
        if bodies.is_empty() {
            return Ok(());
        }
        let url = self.queue_url(queue).await?;

        for chunk in bodies.chunks(SQS_BATCH_LIMIT) {
            let entries = chunk
                .iter()
                .enumerate()
                .map(|(i, body)| {
                    SendMessageBatchRequestEntry::builder()
                        .id(i.to_string())
                        .message_body(body)
                        .build()
                        .map_err(|e| AppError::Queue(e.to_string()))
                })
                .collect::<Result<Vec<_>>>()?;

            let output = self
                .client
                .send_message_batch()
                .queue_url(&url)
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(|e| queue_error(queue, e))?;

            if !output.failed().is_empty() {
                return Err(AppError::Queue(format!(
                    "{}: {} messages failed to send",
                    queue,
                    output.failed().len()
                )));
            }
        }
        Ok(())
    }

    async fn receive(&self, queue: &str, max: usize) -> Result<Vec<String>> {
        let url = self.queue_url(queue).await?;
        let mut bodies = Vec::new();

        while bodies.len() < max {
            let want = (max - bodies.len()).min(SQS_BATCH_LIMIT);
            let output = self
                .client
                .receive_message()
                .queue_url(&url)
                .max_number_of_messages(want as i32)
                .wait_time_seconds(RECEIVE_WAIT_SECS)
                .send()
                .await
                .map_err(|e| queue_error(queue, e))?;

            let messages = output.messages();
            if messages.is_empty() {
                break;
            }

            let mut deletes = Vec::with_capacity(messages.len());
            for (i, message) in messages.iter().enumerate() {
                if let Some(body) = message.body() {
                    bodies.push(body.to_string());
                }
                if let Some(handle) = message.receipt_handle() {
                    deletes.push(
                        DeleteMessageBatchRequestEntry::builder()
                            .id(i.to_string())
                            .receipt_handle(handle)
                            .build()
                            .map_err(|e| AppError::Queue(e.to_string()))?,
                    );
                }
            }

            if !deletes.is_empty() {
                self.client
                    .delete_message_batch()
                    .queue_url(&url)
                    .set_entries(Some(deletes))
                    .send()
                    .await
                    .map_err(|e| queue_error(queue, e))?;
            }
        }

        tracing::debug!(queue = queue, count = bodies.len(), "Received messages");
        Ok(bodies)
    }
}
