//! In-memory provider with delay and visibility-timeout semantics; used by
//! tests and by embedded setups that do not want a real queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::messaging::messages::QueuedMessage;
use crate::messaging::MessagingError;

#[derive(Debug)]
struct StoredMessage {
    msg_id: i64,
    visible_at: DateTime<Utc>,
    read_count: i32,
    enqueued_at: DateTime<Utc>,
    payload: Value,
}

#[derive(Debug, Default)]
pub struct InMemoryProvider {
    queues: Mutex<HashMap<String, Vec<StoredMessage>>>,
    next_id: AtomicI64,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<StoredMessage>>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn ensure_queue(&self, queue_name: &str) -> Result<(), MessagingError> {
        self.lock().entry(queue_name.to_string()).or_default();
        Ok(())
    }

    pub async fn send_delayed<T: Serialize + Sync>(
        &self,
        queue_name: &str,
        payload: &T,
        delay: Duration,
    ) -> Result<i64, MessagingError> {
        let payload = serde_json::to_value(payload)?;
        let msg_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let visible_at = now
            + chrono::Duration::from_std(delay)
                .map_err(|e| MessagingError::Backend(e.to_string()))?;

        self.lock()
            .entry(queue_name.to_string())
            .or_default()
            .push(StoredMessage {
                msg_id,
                visible_at,
                read_count: 0,
                enqueued_at: now,
                payload,
            });
        Ok(msg_id)
    }

    pub async fn read_batch<T: DeserializeOwned>(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        limit: i32,
    ) -> Result<Vec<QueuedMessage<T>>, MessagingError> {
        let now = Utc::now();
        let hold_until = now
            + chrono::Duration::from_std(visibility_timeout)
                .map_err(|e| MessagingError::Backend(e.to_string()))?;

        let mut queues = self.lock();
        let Some(messages) = queues.get_mut(queue_name) else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        for stored in messages.iter_mut() {
            if batch.len() >= limit.max(0) as usize {
                break;
            }
            if stored.visible_at > now {
                continue;
            }
            stored.visible_at = hold_until;
            stored.read_count += 1;
            batch.push(QueuedMessage {
                msg_id: stored.msg_id,
                read_count: stored.read_count,
                enqueued_at: stored.enqueued_at,
                message: serde_json::from_value(stored.payload.clone())?,
            });
        }
        Ok(batch)
    }

    pub async fn delete(&self, queue_name: &str, msg_id: i64) -> Result<bool, MessagingError> {
        let mut queues = self.lock();
        let Some(messages) = queues.get_mut(queue_name) else {
            return Ok(false);
        };
        let before = messages.len();
        messages.retain(|m| m.msg_id != msg_id);
        Ok(messages.len() < before)
    }

    /// Depth including not-yet-visible messages; test observability.
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        self.lock().get(queue_name).map_or(0, |q| q.len())
    }
}
