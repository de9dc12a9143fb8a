//! Workflow coordinator: the loop binding discovery, execution, and
//! finalization for one task invocation.
//!
//! Single-threaded per task; intra-task concurrency lives inside the
//! executor. Across tasks, coordinator invocations run on many workers and
//! share nothing but the database. The loop terminates when discovery comes
//! back empty, when every processed step in a batch is permanently blocked,
//! or when the cycle bound is hit; the finalizer then decides the task's
//! fate.

use std::sync::Arc;

use tracing::{debug, info};

use conveyor_shared::errors::{OrchestrationError, OrchestrationResult};
use conveyor_shared::events::OrchestrationEvent;
use conveyor_shared::models::Task;
use conveyor_shared::registry::{HandlerRegistry, TaskDefinitionRegistry};
use conveyor_shared::state_machine::{TaskEvent, TaskState, TaskStateMachine};
use conveyor_shared::system_context::SystemContext;

use super::step_executor::{StepExecutionOutcome, StepExecutor};
use super::task_finalizer::{FinalizationResult, TaskFinalizer};
use super::viable_step_discovery::ViableStepDiscovery;

#[derive(Debug, Clone)]
pub struct WorkflowCoordinator {
    context: Arc<SystemContext>,
    discovery: ViableStepDiscovery,
    executor: StepExecutor,
    finalizer: TaskFinalizer,
}

impl WorkflowCoordinator {
    pub fn new(
        context: Arc<SystemContext>,
        handlers: Arc<HandlerRegistry>,
        definitions: Arc<TaskDefinitionRegistry>,
    ) -> Self {
        let discovery = ViableStepDiscovery::new(context.clone());
        let executor = StepExecutor::new(context.clone(), handlers, definitions);
        let finalizer = TaskFinalizer::new(context.clone());
        Self {
            context,
            discovery,
            executor,
            finalizer,
        }
    }

    pub fn discovery(&self) -> &ViableStepDiscovery {
        &self.discovery
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn finalizer(&self) -> &TaskFinalizer {
        &self.finalizer
    }

    /// Process one task invocation end to end. Safe to call repeatedly and
    /// from multiple workers; every decision re-reads the database.
    pub async fn process_task(&self, task_id: i64) -> OrchestrationResult<FinalizationResult> {
        let task = Task::find_by_id(self.context.database_pool(), task_id)
            .await?
            .ok_or(OrchestrationError::TaskNotFound(task_id))?;

        let mut machine = TaskStateMachine::new(task_id, self.context.clone());
        let state = machine
            .current_state()
            .await
            .map_err(OrchestrationError::from)?;

        if state.is_terminal() || state == TaskState::Error {
            debug!(
                task_id,
                state = %state,
                "Task already settled; nothing to coordinate"
            );
            return Ok(FinalizationResult::no_action(
                task_id,
                format!("task already in state {state}"),
            ));
        }

        if state == TaskState::Pending {
            machine
                .transition(TaskEvent::Start)
                .await
                .map_err(OrchestrationError::from)?;
            self.context
                .event_publisher()
                .publish(OrchestrationEvent::TaskStarted {
                    task_id,
                    correlation_id: task.correlation_id,
                });
        }

        let max_cycles = self.context.config().execution.max_discovery_cycles.max(1);
        let mut cycles = 0u32;
        loop {
            if cycles >= max_cycles {
                info!(
                    task_id,
                    cycles, "Discovery cycle bound reached; deferring to re-enqueue"
                );
                break;
            }
            cycles += 1;

            let viable = self.discovery.find_viable_steps(task_id, None).await?;
            if viable.is_empty() {
                break;
            }

            debug!(
                task_id,
                correlation_id = %task.correlation_id,
                batch_size = viable.len(),
                cycle = cycles,
                "Executing viable step batch"
            );
            let outcomes = self.executor.execute_batch(&task, viable).await?;

            let processed: Vec<&StepExecutionOutcome> =
                outcomes.iter().filter(|o| o.is_processed()).collect();
            if processed.is_empty() {
                // Every claim lost to other workers; they own the progress.
                break;
            }
            if processed.iter().all(|o| o.is_permanently_blocked()) {
                break;
            }
        }

        self.finalizer.finalize_task(task_id).await
    }
}
