//! Messaging providers behind enum dispatch — no trait objects on the send
//! path.

pub mod memory;
pub mod pgmq;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::messages::QueuedMessage;
use super::MessagingError;
pub use memory::InMemoryProvider;
pub use pgmq::PgmqProvider;

#[derive(Debug)]
pub enum MessagingProvider {
    Pgmq(PgmqProvider),
    InMemory(InMemoryProvider),
}

impl MessagingProvider {
    pub fn provider_name(&self) -> &'static str {
        match self {
            MessagingProvider::Pgmq(_) => "pgmq",
            MessagingProvider::InMemory(_) => "in_memory",
        }
    }

    pub async fn ensure_queue(&self, queue_name: &str) -> Result<(), MessagingError> {
        match self {
            MessagingProvider::Pgmq(p) => p.ensure_queue(queue_name).await,
            MessagingProvider::InMemory(p) => p.ensure_queue(queue_name).await,
        }
    }

    pub async fn send_delayed<T: Serialize + Sync>(
        &self,
        queue_name: &str,
        payload: &T,
        delay: Duration,
    ) -> Result<i64, MessagingError> {
        match self {
            MessagingProvider::Pgmq(p) => p.send_delayed(queue_name, payload, delay).await,
            MessagingProvider::InMemory(p) => p.send_delayed(queue_name, payload, delay).await,
        }
    }

    pub async fn read_batch<T: DeserializeOwned>(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
        limit: i32,
    ) -> Result<Vec<QueuedMessage<T>>, MessagingError> {
        match self {
            MessagingProvider::Pgmq(p) => {
                p.read_batch(queue_name, visibility_timeout, limit).await
            }
            MessagingProvider::InMemory(p) => {
                p.read_batch(queue_name, visibility_timeout, limit).await
            }
        }
    }

    pub async fn delete(&self, queue_name: &str, msg_id: i64) -> Result<bool, MessagingError> {
        match self {
            MessagingProvider::Pgmq(p) => p.delete(queue_name, msg_id).await,
            MessagingProvider::InMemory(p) => p.delete(queue_name, msg_id).await,
        }
    }
}
