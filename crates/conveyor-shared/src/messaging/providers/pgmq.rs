//! PGMQ-backed provider: Postgres-native queues with visibility-timeout
//! semantics, so the queue shares the engine's transactional substrate.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::PgPool;

use crate::messaging::messages::QueuedMessage;
use crate::messaging::MessagingError;

pub struct PgmqProvider {
    queue: pgmq::PGMQueue,
}

impl std::fmt::Debug for PgmqProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgmqProvider").finish_non_exhaustive()
    }
}

impl PgmqProvider {
    pub async fn new(pool: PgPool) -> Self {
        Self {
            queue: pgmq::PGMQueue::new_with_pool(pool).await,
        }
    }

    /// Idempotent queue creation.
    pub async fn ensure_queue(&self, queue_name: &str) -> Result<(), MessagingError> {
        self.queue
            .create(queue_name)
            .await
            .map_err(|e| MessagingError::Backend(e.to_string()))
    }

    pub async fn send_delayed<T: Serialize + Sync>(
        &self,
        queue_name: &str,
        payload: &T,
        delay: Duration,
    ) -> Result<i64, MessagingError> {
        let msg_id = if delay.is_zero() {
            self.queue
                .send(queue_name, payload)
                .await
                .map_err(|e| MessagingError::Backend(e.to_string()))?
        } else {
            self.queue
                .send_delay(queue_name, payload, delay.as_secs())
                .await
                .map_err(|e| MessagingError::Backend(e.to_string()))?
        };
        Ok(msg_id)
    }

    pub async fn read_batch<T: DeserializeOwned>(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        limit: i32,
    ) -> Result<Vec<QueuedMessage<T>>, MessagingError> {
        let vt = i32::try_from(visibility_timeout.as_secs()).unwrap_or(i32::MAX);
        let messages = self
            .queue
            .read_batch::<T>(queue_name, Some(vt), limit)
            .await
            .map_err(|e| MessagingError::Backend(e.to_string()))?;

        Ok(messages
            .unwrap_or_default()
            .into_iter()
            .map(|m| QueuedMessage {
                msg_id: m.msg_id,
                read_count: m.read_ct,
                enqueued_at: m.enqueued_at,
                message: m.message,
            })
            .collect())
    }

    pub async fn delete(&self, queue_name: &str, msg_id: i64) -> Result<bool, MessagingError> {
        let deleted = self
            .queue
            .delete(queue_name, msg_id)
            .await
            .map_err(|e| MessagingError::Backend(e.to_string()))?;
        Ok(deleted > 0)
    }
}
