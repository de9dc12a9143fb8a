//! Domain-level messaging client.
//!
//! Wraps a [`MessagingProvider`] enum and the queue configuration; callers
//! speak in tasks and enqueue reasons, not queue names and delays. A
//! `not_before` timestamp is translated into a provider delay — a timestamp
//! in the past sends immediately.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::QueueConfig;

use super::messages::{EnqueueReason, QueuedMessage, TaskProcessMessage};
use super::providers::MessagingProvider;
use super::MessagingError;

#[derive(Debug, Clone)]
pub struct MessageClient {
    provider: Arc<MessagingProvider>,
    queue_config: Arc<QueueConfig>,
}

impl MessageClient {
    pub fn new(provider: Arc<MessagingProvider>, queue_config: Arc<QueueConfig>) -> Self {
        Self {
            provider,
            queue_config,
        }
    }

    pub fn provider(&self) -> &Arc<MessagingProvider> {
        &self.provider
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    pub fn task_queue(&self) -> &str {
        &self.queue_config.task_queue
    }

    pub async fn ensure_task_queue(&self) -> Result<(), MessagingError> {
        self.provider
            .ensure_queue(&self.queue_config.task_queue)
            .await
    }

    /// Publish a "process task" message, delayed until `not_before` when one
    /// is given.
    pub async fn enqueue_task(
        &self,
        task_id: i64,
        reason: EnqueueReason,
        not_before: Option<DateTime<Utc>>,
        correlation_id: Option<Uuid>,
    ) -> Result<i64, MessagingError> {
        let delay = not_before
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);

        let message = TaskProcessMessage {
            task_id,
            reason,
            not_before,
            correlation_id,
        };

        let msg_id = self
            .provider
            .send_delayed(&self.queue_config.task_queue, &message, delay)
            .await?;

        debug!(
            task_id,
            reason = %reason,
            delay_seconds = delay.as_secs(),
            msg_id,
            "Enqueued process-task message"
        );
        Ok(msg_id)
    }

    pub async fn receive_task_messages(
        &self,
    ) -> Result<Vec<QueuedMessage<TaskProcessMessage>>, MessagingError> {
        self.provider
            .read_batch(
                &self.queue_config.task_queue,
                self.queue_config.visibility_timeout(),
                self.queue_config.batch_size,
            )
            .await
    }

    pub async fn delete_task_message(&self, msg_id: i64) -> Result<bool, MessagingError> {
        self.provider
            .delete(&self.queue_config.task_queue, msg_id)
            .await
    }
}
