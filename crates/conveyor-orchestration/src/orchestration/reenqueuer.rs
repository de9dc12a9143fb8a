//! Task re-enqueuer: a thin publisher.
//!
//! Builds the "process task" envelope and hands it to the queue. It never
//! re-enters the coordinator — a finalizer that called back into processing
//! "just in case" is a reentrancy loop waiting to storm the queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use conveyor_shared::errors::{OrchestrationError, OrchestrationResult};
use conveyor_shared::events::OrchestrationEvent;
use conveyor_shared::messaging::EnqueueReason;
use conveyor_shared::models::Task;
use conveyor_shared::system_context::SystemContext;

#[derive(Debug, Clone)]
pub struct TaskReenqueuer {
    context: Arc<SystemContext>,
}

impl TaskReenqueuer {
    pub fn new(context: Arc<SystemContext>) -> Self {
        Self { context }
    }

    /// Publish a process-task message, delayed until `not_before` when set.
    pub async fn reenqueue(
        &self,
        task: &Task,
        reason: EnqueueReason,
        not_before: Option<DateTime<Utc>>,
    ) -> OrchestrationResult<()> {
        self.context
            .message_client()
            .enqueue_task(task.task_id, reason, not_before, Some(task.correlation_id))
            .await
            .map_err(|e| OrchestrationError::MessagingError(e.to_string()))?;

        self.context
            .event_publisher()
            .publish(OrchestrationEvent::TaskReenqueued {
                task_id: task.task_id,
                reason: reason.to_string(),
            });
        debug!(
            task_id = task.task_id,
            correlation_id = %task.correlation_id,
            reason = %reason,
            not_before = ?not_before,
            "Task re-enqueued"
        );
        Ok(())
    }
}
