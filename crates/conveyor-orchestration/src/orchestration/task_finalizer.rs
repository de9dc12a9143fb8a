//! Task finalizer: after a batch completes, decide what happens to the task
//! next by dispatching on the execution-context roll-up.
//!
//! Terminal transitions are guarded: the finalizer re-reads the execution
//! context inside the same transaction that performs the transition (under a
//! task row lock), closing the race where another worker completes the final
//! step between the decision and the write. Everything non-terminal is
//! delegated to the re-enqueuer; the finalizer never loops back into step
//! processing itself.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use conveyor_shared::database::SqlFunctionExecutor;
use conveyor_shared::errors::{OrchestrationError, OrchestrationResult};
use conveyor_shared::events::OrchestrationEvent;
use conveyor_shared::messaging::EnqueueReason;
use conveyor_shared::models::orchestration::{
    ExecutionStatus, HealthStatus, TaskExecutionContext,
};
use conveyor_shared::models::Task;
use conveyor_shared::state_machine::{TaskEvent, TaskStateMachine};
use conveyor_shared::system_context::SystemContext;

use super::backoff::BackoffCalculator;
use super::reenqueuer::TaskReenqueuer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizationAction {
    /// Task transitioned to `complete`.
    Completed,
    /// Task transitioned to `error`.
    Failed,
    /// A process-task message was published; the task stays live.
    Reenqueued,
    /// Nothing to do (already terminal).
    NoAction,
}

#[derive(Debug, Clone)]
pub struct FinalizationResult {
    pub task_id: i64,
    pub action: FinalizationAction,
    pub execution_status: Option<ExecutionStatus>,
    pub health_status: Option<HealthStatus>,
    pub total_steps: Option<i64>,
    pub completion_percentage: Option<BigDecimal>,
    pub reason: Option<String>,
}

impl FinalizationResult {
    fn from_context(
        task_id: i64,
        action: FinalizationAction,
        context: &TaskExecutionContext,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            action,
            execution_status: Some(context.execution_status),
            health_status: Some(context.health_status),
            total_steps: Some(context.total_steps),
            completion_percentage: Some(context.completion_percentage.clone()),
            reason: Some(reason.into()),
        }
    }

    pub fn no_action(task_id: i64, reason: impl Into<String>) -> Self {
        Self {
            task_id,
            action: FinalizationAction::NoAction,
            execution_status: None,
            health_status: None,
            total_steps: None,
            completion_percentage: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskFinalizer {
    context: Arc<SystemContext>,
    sql_executor: SqlFunctionExecutor,
    reenqueuer: TaskReenqueuer,
    backoff: BackoffCalculator,
}

impl TaskFinalizer {
    pub fn new(context: Arc<SystemContext>) -> Self {
        let sql_executor = SqlFunctionExecutor::new(context.database_pool().clone());
        let reenqueuer = TaskReenqueuer::new(context.clone());
        let backoff = BackoffCalculator::new(context.clone());
        Self {
            context,
            sql_executor,
            reenqueuer,
            backoff,
        }
    }

    /// Decide the task's fate from its execution context. Idempotent:
    /// finalizing twice terminalizes once or re-enqueues once, never both.
    pub async fn finalize_task(&self, task_id: i64) -> OrchestrationResult<FinalizationResult> {
        let task = Task::find_by_id(self.context.database_pool(), task_id)
            .await?
            .ok_or(OrchestrationError::TaskNotFound(task_id))?;

        // Terminal branches may observe a concurrent change inside the guard
        // transaction; one re-read of the fresh context is enough before
        // handing the task back to the queue.
        for _ in 0..2 {
            let context = self
                .sql_executor
                .get_task_execution_context(task_id)
                .await?
                .ok_or(OrchestrationError::TaskNotFound(task_id))?;

            debug!(
                task_id,
                correlation_id = %task.correlation_id,
                execution_status = %context.execution_status,
                ready_steps = context.ready_steps,
                failed_steps = context.failed_steps,
                permanently_blocked_steps = context.permanently_blocked_steps,
                "Finalizer dispatching on execution status"
            );

            match context.execution_status {
                ExecutionStatus::HasReadySteps => {
                    self.reenqueuer
                        .reenqueue(&task, EnqueueReason::StepCompleted, None)
                        .await?;
                    return Ok(FinalizationResult::from_context(
                        task_id,
                        FinalizationAction::Reenqueued,
                        &context,
                        "ready steps remain",
                    ));
                }
                ExecutionStatus::Processing => {
                    let delay = i64::from(
                        self.context
                            .config()
                            .backoff
                            .reenqueue_processing_delay_seconds,
                    );
                    self.reenqueuer
                        .reenqueue(
                            &task,
                            EnqueueReason::BackoffWait,
                            Some(Utc::now() + Duration::seconds(delay)),
                        )
                        .await?;
                    return Ok(FinalizationResult::from_context(
                        task_id,
                        FinalizationAction::Reenqueued,
                        &context,
                        "steps in progress in another worker",
                    ));
                }
                ExecutionStatus::WaitingForDependencies => {
                    let (reason, not_before) = self.waiting_wakeup(task_id).await?;
                    self.reenqueuer.reenqueue(&task, reason, not_before).await?;
                    return Ok(FinalizationResult::from_context(
                        task_id,
                        FinalizationAction::Reenqueued,
                        &context,
                        "waiting on dependencies or backoff",
                    ));
                }
                ExecutionStatus::AllComplete => {
                    if let Some(result) = self.complete_task_guarded(&task).await? {
                        return Ok(result);
                    }
                }
                ExecutionStatus::BlockedByFailures => {
                    if let Some(result) = self.error_task_guarded(&task).await? {
                        return Ok(result);
                    }
                }
            }

            debug!(
                task_id,
                "Finalization guard observed concurrent change; re-reading context"
            );
        }

        // The context kept shifting under us; let the queue try again.
        warn!(task_id, "Execution context unstable during finalization; re-enqueueing");
        self.reenqueuer
            .reenqueue(
                &task,
                EnqueueReason::BackoffWait,
                Some(
                    Utc::now()
                        + Duration::seconds(i64::from(
                            self.context.config().backoff.reenqueue_default_delay_seconds,
                        )),
                ),
            )
            .await?;
        Ok(FinalizationResult {
            task_id,
            action: FinalizationAction::Reenqueued,
            execution_status: None,
            health_status: None,
            total_steps: None,
            completion_percentage: None,
            reason: Some("state changed during finalization".to_string()),
        })
    }

    /// Wake-up for the waiting branch: the nearest retry window when one
    /// exists (typically a step in backoff), otherwise a default delay.
    async fn waiting_wakeup(
        &self,
        task_id: i64,
    ) -> OrchestrationResult<(EnqueueReason, Option<chrono::DateTime<Utc>>)> {
        let rows = self
            .sql_executor
            .get_step_readiness_status(task_id, None)
            .await?;
        match self.backoff.nearest_retry_at(&rows) {
            Some(at) => Ok((EnqueueReason::Retry, Some(at))),
            None => Ok((
                EnqueueReason::BackoffWait,
                Some(
                    Utc::now()
                        + Duration::seconds(i64::from(
                            self.context.config().backoff.reenqueue_default_delay_seconds,
                        )),
                ),
            )),
        }
    }

    /// Mark the task complete, guarded: lock the task row, re-read the
    /// context in the same transaction, and only then transition. Returns
    /// `None` when the guard re-read disagrees with the decision.
    async fn complete_task_guarded(
        &self,
        task: &Task,
    ) -> OrchestrationResult<Option<FinalizationResult>> {
        let mut tx = self.context.database_pool().begin().await?;

        sqlx::query("SELECT task_id FROM conveyor.tasks WHERE task_id = $1 FOR UPDATE")
            .bind(task.task_id)
            .fetch_one(&mut *tx)
            .await?;

        let context = SqlFunctionExecutor::get_task_execution_context_in(&mut tx, task.task_id)
            .await?
            .ok_or(OrchestrationError::TaskNotFound(task.task_id))?;
        if context.execution_status != ExecutionStatus::AllComplete {
            return Ok(None);
        }

        let mut machine = TaskStateMachine::new(task.task_id, self.context.clone());
        machine
            .transition_in(&mut tx, TaskEvent::Complete)
            .await
            .map_err(|e| OrchestrationError::StateTransitionFailed {
                entity_type: "task",
                entity_id: task.task_id,
                reason: e.to_string(),
            })?;

        tx.commit().await?;

        self.context
            .event_publisher()
            .publish(OrchestrationEvent::TaskFinalized {
                task_id: task.task_id,
                outcome: "complete".to_string(),
            });
        info!(
            task_id = task.task_id,
            correlation_id = %task.correlation_id,
            total_steps = context.total_steps,
            "Task complete"
        );
        Ok(Some(FinalizationResult::from_context(
            task.task_id,
            FinalizationAction::Completed,
            &context,
            "all steps terminally successful",
        )))
    }

    /// Mark the task failed, with the same guard shape as completion.
    async fn error_task_guarded(
        &self,
        task: &Task,
    ) -> OrchestrationResult<Option<FinalizationResult>> {
        let mut tx = self.context.database_pool().begin().await?;

        sqlx::query("SELECT task_id FROM conveyor.tasks WHERE task_id = $1 FOR UPDATE")
            .bind(task.task_id)
            .fetch_one(&mut *tx)
            .await?;

        let context = SqlFunctionExecutor::get_task_execution_context_in(&mut tx, task.task_id)
            .await?
            .ok_or(OrchestrationError::TaskNotFound(task.task_id))?;
        if context.execution_status != ExecutionStatus::BlockedByFailures {
            return Ok(None);
        }

        let mut machine = TaskStateMachine::new(task.task_id, self.context.clone());
        machine
            .transition_in(
                &mut tx,
                TaskEvent::Fail(format!(
                    "{} permanently failed step(s)",
                    context.permanently_blocked_steps
                )),
            )
            .await
            .map_err(|e| OrchestrationError::StateTransitionFailed {
                entity_type: "task",
                entity_id: task.task_id,
                reason: e.to_string(),
            })?;

        tx.commit().await?;

        self.context
            .event_publisher()
            .publish(OrchestrationEvent::TaskFinalized {
                task_id: task.task_id,
                outcome: "error".to_string(),
            });
        warn!(
            task_id = task.task_id,
            correlation_id = %task.correlation_id,
            permanently_blocked_steps = context.permanently_blocked_steps,
            "Task blocked by failures; marked error"
        );
        Ok(Some(FinalizationResult::from_context(
            task.task_id,
            FinalizationAction::Failed,
            &context,
            "blocked by permanently failed steps",
        )))
    }
}
