//! Queue transport: the "process task" message, provider backends, and the
//! domain-level client.

pub mod client;
pub mod messages;
pub mod providers;

use thiserror::Error;

pub use client::MessageClient;
pub use messages::{EnqueueReason, QueuedMessage, TaskProcessMessage};
pub use providers::{InMemoryProvider, MessagingProvider, PgmqProvider};

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Messaging backend error: {0}")]
    Backend(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
