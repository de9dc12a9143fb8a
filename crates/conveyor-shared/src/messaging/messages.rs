//! Queue message types.
//!
//! The engine publishes exactly one message type: "process task". Delivery is
//! at-least-once; duplicates are safe because readiness and finalization are
//! idempotent on the same database state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a task was (re-)enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueReason {
    /// First enqueue after task creation.
    Initial,
    /// A step finished; more work may now be ready.
    StepCompleted,
    /// A failed step's retry window opened (or will open at `not_before`).
    Retry,
    /// Nothing ready yet; wake up when the nearest backoff window opens.
    BackoffWait,
}

impl EnqueueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnqueueReason::Initial => "initial",
            EnqueueReason::StepCompleted => "step_completed",
            EnqueueReason::Retry => "retry",
            EnqueueReason::BackoffWait => "backoff_wait",
        }
    }
}

impl std::fmt::Display for EnqueueReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The "process task" envelope. Consumers trust nothing in here beyond the
/// task id; all state is re-read from the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProcessMessage {
    pub task_id: i64,
    pub reason: EnqueueReason,
    /// Earliest time the message should become visible.
    pub not_before: Option<DateTime<Utc>>,
    /// Tracing only; carried so log lines across processes correlate.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

/// A message handed to a consumer, with its receipt bookkeeping.
#[derive(Debug, Clone)]
pub struct QueuedMessage<T> {
    pub msg_id: i64,
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
    pub message: T,
}
