//! Inbound queue consumer: receives "process task" messages and invokes the
//! coordinator.
//!
//! Nothing in the message is trusted beyond the task id; the coordinator
//! re-reads everything from the database. A message is deleted only after a
//! successful coordination pass — on failure it stays invisible until the
//! visibility timeout expires and is re-delivered, which is safe because the
//! whole pipeline is idempotent on database state.

use std::sync::Arc;

use tracing::{debug, error, warn};

use conveyor_shared::errors::{OrchestrationError, OrchestrationResult};
use conveyor_shared::system_context::SystemContext;

use super::coordinator::WorkflowCoordinator;

#[derive(Debug, Clone)]
pub struct TaskQueueProcessor {
    context: Arc<SystemContext>,
    coordinator: Arc<WorkflowCoordinator>,
}

impl TaskQueueProcessor {
    pub fn new(context: Arc<SystemContext>, coordinator: Arc<WorkflowCoordinator>) -> Self {
        Self {
            context,
            coordinator,
        }
    }

    /// Drain one batch from the task queue. Returns how many messages were
    /// received (processed or left for redelivery).
    pub async fn process_next_batch(&self) -> OrchestrationResult<usize> {
        let messages = self
            .context
            .message_client()
            .receive_task_messages()
            .await
            .map_err(|e| OrchestrationError::MessagingError(e.to_string()))?;
        let received = messages.len();

        for queued in messages {
            let task_id = queued.message.task_id;
            match self.coordinator.process_task(task_id).await {
                Ok(result) => {
                    debug!(
                        task_id,
                        msg_id = queued.msg_id,
                        reason = %queued.message.reason,
                        action = ?result.action,
                        "Task coordination pass finished"
                    );
                    self.delete_message(queued.msg_id).await;
                }
                Err(OrchestrationError::TaskNotFound(_)) => {
                    // Poison message; redelivery will never succeed.
                    warn!(
                        task_id,
                        msg_id = queued.msg_id,
                        "Dropping process-task message for unknown task"
                    );
                    self.delete_message(queued.msg_id).await;
                }
                Err(e) => {
                    // Leave the message for redelivery after the visibility
                    // timeout; the task remains in its last persisted state.
                    warn!(
                        task_id,
                        msg_id = queued.msg_id,
                        error = %e,
                        "Task coordination failed; message will be re-delivered"
                    );
                }
            }
        }
        Ok(received)
    }

    async fn delete_message(&self, msg_id: i64) {
        if let Err(e) = self
            .context
            .message_client()
            .delete_task_message(msg_id)
            .await
        {
            // At-least-once delivery: a failed delete only means one extra
            // (idempotent) coordination pass later.
            warn!(msg_id, error = %e, "Failed to delete processed message");
        }
    }

    /// Poll loop. Sleeps the configured interval when the queue is empty and
    /// backs off briefly on transport errors instead of exiting.
    pub async fn run(&self) {
        let poll_interval = self.context.config().queue.poll_interval();
        loop {
            match self.process_next_batch().await {
                Ok(0) => tokio::time::sleep(poll_interval).await,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Queue poll failed; backing off");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }
}
