//! In-process lifecycle events.
//!
//! A typed broadcaster over `tokio::sync::broadcast`: publishing copies the
//! event to every registered sink and never blocks — a slow subscriber lags
//! and misses events rather than back-pressuring the executor. Subscribers
//! are telemetry only; no business logic may depend on them.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    TaskStarted {
        task_id: i64,
        correlation_id: Uuid,
    },
    StepStarted {
        task_id: i64,
        workflow_step_id: i64,
        name: String,
        attempt: i32,
    },
    StepCompleted {
        task_id: i64,
        workflow_step_id: i64,
        name: String,
    },
    StepFailed {
        task_id: i64,
        workflow_step_id: i64,
        name: String,
        error: String,
        will_retry: bool,
    },
    TaskFinalized {
        task_id: i64,
        outcome: String,
    },
    TaskReenqueued {
        task_id: i64,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<OrchestrationEvent>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Fire-and-forget: a send with no subscribers is not an error.
    pub fn publish(&self, event: OrchestrationEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}
