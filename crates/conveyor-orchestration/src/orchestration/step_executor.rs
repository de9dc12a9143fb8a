//! Step executor: runs a batch of viable steps and commits each outcome
//! through the state machines.
//!
//! Claim, bookkeeping, and transition commit in one transaction per step, so
//! at most one worker ever holds a step (`in_process` exclusion). Handler
//! failures are data: they are recorded on the step and classified for
//! retry, never propagated as engine errors, and one step's failure never
//! aborts concurrent siblings.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use conveyor_shared::database::SqlFunctionExecutor;
use conveyor_shared::errors::{OrchestrationError, OrchestrationResult, StateMachineError};
use conveyor_shared::events::OrchestrationEvent;
use conveyor_shared::models::{Task, WorkflowStep};
use conveyor_shared::registry::{
    HandlerFailure, HandlerRegistry, StepHandlerInput, StepMetadata, TaskDefinition,
    TaskDefinitionRegistry,
};
use conveyor_shared::state_machine::{StepEvent, StepStateMachine};
use conveyor_shared::system_context::SystemContext;

use super::viable_step_discovery::ViableStep;

/// What happened to one step of a batch.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed {
        results: Value,
    },
    Failed {
        error: String,
        /// Retry budget exhausted (or the step is non-retryable); nothing
        /// will run this step again.
        permanently_blocked: bool,
    },
    /// Another worker claimed the step first; silently skipped.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct StepExecutionOutcome {
    pub workflow_step_id: i64,
    pub name: String,
    pub outcome: StepOutcome,
}

impl StepExecutionOutcome {
    pub fn is_processed(&self) -> bool {
        !matches!(self.outcome, StepOutcome::Skipped)
    }

    pub fn is_permanently_blocked(&self) -> bool {
        matches!(
            self.outcome,
            StepOutcome::Failed {
                permanently_blocked: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone)]
pub struct StepExecutor {
    context: Arc<SystemContext>,
    handlers: Arc<HandlerRegistry>,
    definitions: Arc<TaskDefinitionRegistry>,
    sql_executor: SqlFunctionExecutor,
    concurrency_limit: Arc<Semaphore>,
}

impl StepExecutor {
    pub fn new(
        context: Arc<SystemContext>,
        handlers: Arc<HandlerRegistry>,
        definitions: Arc<TaskDefinitionRegistry>,
    ) -> Self {
        let limit = context.config().execution.max_concurrent_steps.max(1);
        let sql_executor = SqlFunctionExecutor::new(context.database_pool().clone());
        Self {
            context,
            handlers,
            definitions,
            sql_executor,
            concurrency_limit: Arc::new(Semaphore::new(limit)),
        }
    }

    fn pool(&self) -> &PgPool {
        self.context.database_pool()
    }

    /// Run a batch of viable steps, concurrently or sequentially per the
    /// task's definition, and return one outcome per attempted step.
    pub async fn execute_batch(
        &self,
        task: &Task,
        batch: Vec<ViableStep>,
    ) -> OrchestrationResult<Vec<StepExecutionOutcome>> {
        let definition = self
            .definitions
            .get(task.named_task_id)
            .ok_or(OrchestrationError::DefinitionNotFound(task.named_task_id))?;

        if definition.concurrent && batch.len() > 1 {
            self.execute_concurrent(task, &definition, batch).await
        } else {
            self.execute_sequential(task, &definition, batch).await
        }
    }

    async fn execute_concurrent(
        &self,
        task: &Task,
        definition: &Arc<TaskDefinition>,
        batch: Vec<ViableStep>,
    ) -> OrchestrationResult<Vec<StepExecutionOutcome>> {
        let mut handles = Vec::with_capacity(batch.len());
        for viable in batch {
            let executor = self.clone();
            let task = task.clone();
            let definition = definition.clone();
            handles.push(tokio::spawn(async move {
                executor.execute_single(&task, &definition, viable).await
            }));
        }

        // The batch completes when every step has finished, success or
        // failure; engine errors surface only after all siblings settle.
        let mut outcomes = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(error)) => {
                    first_error.get_or_insert(error);
                }
                Err(join_error) => {
                    first_error.get_or_insert(OrchestrationError::DatabaseError {
                        operation: "execute_single".to_string(),
                        reason: format!("executor task panicked: {join_error}"),
                    });
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(outcomes),
        }
    }

    async fn execute_sequential(
        &self,
        task: &Task,
        definition: &Arc<TaskDefinition>,
        mut batch: Vec<ViableStep>,
    ) -> OrchestrationResult<Vec<StepExecutionOutcome>> {
        // Dependency-level order; siblings at the same level keep id order.
        let levels = self.sql_executor.get_dependency_levels(task.task_id).await?;
        batch.sort_by_key(|v| {
            (
                levels.get(&v.step.workflow_step_id).copied().unwrap_or(0),
                v.step.workflow_step_id,
            )
        });

        let halt_on_failure = definition.halt_on_first_failure
            || self.context.config().execution.halt_batch_on_first_failure;

        let mut outcomes = Vec::with_capacity(batch.len());
        for viable in batch {
            let outcome = self.execute_single(task, definition, viable).await?;
            let failed = matches!(outcome.outcome, StepOutcome::Failed { .. });
            outcomes.push(outcome);
            if failed && halt_on_failure {
                debug!(
                    task_id = task.task_id,
                    "Halting sequential batch on first failure (task opted in)"
                );
                break;
            }
        }
        Ok(outcomes)
    }

    /// Claim and run one step; per-step procedure of the executor contract.
    async fn execute_single(
        &self,
        task: &Task,
        definition: &TaskDefinition,
        viable: ViableStep,
    ) -> OrchestrationResult<StepExecutionOutcome> {
        let _permit = self
            .concurrency_limit
            .acquire()
            .await
            .map_err(|e| OrchestrationError::DatabaseError {
                operation: "acquire_step_permit".to_string(),
                reason: e.to_string(),
            })?;

        let step_id = viable.step.workflow_step_id;
        let name = viable.step.name.clone();

        let Some(claimed) = self.claim_step(step_id).await? else {
            debug!(
                task_id = task.task_id,
                workflow_step_id = step_id,
                "Step already claimed elsewhere; skipping"
            );
            return Ok(StepExecutionOutcome {
                workflow_step_id: step_id,
                name,
                outcome: StepOutcome::Skipped,
            });
        };

        self.context
            .event_publisher()
            .publish(OrchestrationEvent::StepStarted {
                task_id: task.task_id,
                workflow_step_id: step_id,
                name: name.clone(),
                attempt: claimed.attempts,
            });

        // Missing template or handler is a configuration failure: fatal for
        // the step, never retried.
        let resolved = definition.step_by_name(&claimed.name).and_then(|template| {
            self.handlers
                .get(&definition.namespace, &template.handler)
                .map(|handler| (template, handler))
        });
        let Some((template, handler)) = resolved else {
            let failure = HandlerFailure::new(format!(
                "no handler registered for step '{}' in namespace '{}'",
                claimed.name, definition.namespace
            ))
            .with_class("ConfigurationError");
            let outcome = self
                .fail_step(task, &claimed, failure, false, true)
                .await?;
            return Ok(StepExecutionOutcome {
                workflow_step_id: step_id,
                name,
                outcome,
            });
        };

        let input = StepHandlerInput {
            task_context: task.context_or_empty(),
            upstream_results: claimed.parent_results(self.pool()).await?,
            step_metadata: StepMetadata {
                workflow_step_id: step_id,
                task_id: task.task_id,
                name: claimed.name.clone(),
                attempt: claimed.attempts,
                retry_limit: claimed.retry_limit,
                handler_config: template.handler_config.clone(),
            },
        };

        let timeout = template
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.context.config().execution.default_step_timeout());

        let outcome =
            match tokio::time::timeout(timeout, AssertUnwindSafe(handler.call(input)).catch_unwind())
                .await
            {
                Err(_elapsed) => {
                    let failure = HandlerFailure::new(format!(
                        "step execution timed out after {}s",
                        timeout.as_secs()
                    ))
                    .with_class("TimeoutError");
                    self.fail_step(task, &claimed, failure, true, false).await?
                }
                Ok(Err(_panic)) => {
                    let failure =
                        HandlerFailure::new("handler panicked").with_class("PanicError");
                    self.fail_step(task, &claimed, failure, false, false).await?
                }
                Ok(Ok(Ok(results))) => self.complete_step(task, &claimed, results).await?,
                Ok(Ok(Err(failure))) => {
                    self.fail_step(task, &claimed, failure, false, false).await?
                }
            };

        Ok(StepExecutionOutcome {
            workflow_step_id: step_id,
            name,
            outcome,
        })
    }

    /// Atomically claim a step: guarded transition to `in_progress` plus the
    /// attempt bookkeeping, in one transaction. Returns `None` when another
    /// worker got there first.
    async fn claim_step(&self, workflow_step_id: i64) -> OrchestrationResult<Option<WorkflowStep>> {
        let mut tx = self.pool().begin().await?;

        let step: Option<WorkflowStep> = sqlx::query_as(
            "SELECT * FROM conveyor.workflow_steps WHERE workflow_step_id = $1 FOR UPDATE",
        )
        .bind(workflow_step_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(step) = step else {
            return Ok(None);
        };
        if step.processed || step.in_process {
            return Ok(None);
        }

        let mut machine = StepStateMachine::new(workflow_step_id, self.context.clone());
        match machine.transition_in(&mut tx, StepEvent::Start).await {
            Ok(true) => {}
            // Already in_progress, or the state moved under us: lost the race.
            Ok(false) => return Ok(None),
            Err(
                StateMachineError::InvalidTransition { .. }
                | StateMachineError::TerminalState { .. },
            ) => return Ok(None),
            Err(error) => return Err(error.into()),
        }

        let claimed: WorkflowStep = sqlx::query_as(
            r#"
            UPDATE conveyor.workflow_steps
            SET attempts = attempts + 1,
                last_attempted_at = NOW(),
                in_process = TRUE,
                updated_at = NOW()
            WHERE workflow_step_id = $1
            RETURNING *
            "#,
        )
        .bind(workflow_step_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(claimed))
    }

    async fn complete_step(
        &self,
        task: &Task,
        step: &WorkflowStep,
        results: Value,
    ) -> OrchestrationResult<StepOutcome> {
        let mut tx = self.pool().begin().await?;

        let mut machine = StepStateMachine::new(step.workflow_step_id, self.context.clone());
        machine
            .transition_in(&mut tx, StepEvent::Complete(None))
            .await
            .map_err(|e| OrchestrationError::StateTransitionFailed {
                entity_type: "workflow_step",
                entity_id: step.workflow_step_id,
                reason: e.to_string(),
            })?;

        sqlx::query(
            r#"
            UPDATE conveyor.workflow_steps
            SET processed = TRUE, in_process = FALSE, results = $2, updated_at = NOW()
            WHERE workflow_step_id = $1
            "#,
        )
        .bind(step.workflow_step_id)
        .bind(&results)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.context
            .event_publisher()
            .publish(OrchestrationEvent::StepCompleted {
                task_id: task.task_id,
                workflow_step_id: step.workflow_step_id,
                name: step.name.clone(),
            });
        debug!(
            task_id = task.task_id,
            workflow_step_id = step.workflow_step_id,
            "Step completed"
        );
        Ok(StepOutcome::Completed { results })
    }

    async fn fail_step(
        &self,
        task: &Task,
        step: &WorkflowStep,
        failure: HandlerFailure,
        timed_out: bool,
        configuration_failure: bool,
    ) -> OrchestrationResult<StepOutcome> {
        let error_record = json!({
            "error": {
                "message": failure.message.clone(),
                "error_class": failure.error_class.clone(),
                "timeout": timed_out,
                "attempt": step.attempts,
            }
        });

        let mut tx = self.pool().begin().await?;

        let mut machine = StepStateMachine::new(step.workflow_step_id, self.context.clone());
        machine
            .transition_in(&mut tx, StepEvent::Fail(failure.message.clone()))
            .await
            .map_err(|e| OrchestrationError::StateTransitionFailed {
                entity_type: "workflow_step",
                entity_id: step.workflow_step_id,
                reason: e.to_string(),
            })?;

        // Configuration failures fail fast: no retry budget can fix a
        // missing handler.
        sqlx::query(
            r#"
            UPDATE conveyor.workflow_steps
            SET in_process = FALSE,
                results = $2,
                backoff_request_seconds = COALESCE($3, backoff_request_seconds),
                retryable = CASE WHEN $4 THEN FALSE ELSE retryable END,
                updated_at = NOW()
            WHERE workflow_step_id = $1
            "#,
        )
        .bind(step.workflow_step_id)
        .bind(&error_record)
        .bind(failure.backoff_request_seconds)
        .bind(configuration_failure)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let will_retry = !configuration_failure
            && step.retryable
            && step.attempts < step.retry_limit;

        self.context
            .event_publisher()
            .publish(OrchestrationEvent::StepFailed {
                task_id: task.task_id,
                workflow_step_id: step.workflow_step_id,
                name: step.name.clone(),
                error: failure.message.clone(),
                will_retry,
            });
        warn!(
            task_id = task.task_id,
            workflow_step_id = step.workflow_step_id,
            attempt = step.attempts,
            retry_limit = step.retry_limit,
            will_retry,
            error = %failure,
            "Step failed"
        );

        Ok(StepOutcome::Failed {
            error: failure.message,
            permanently_blocked: !will_retry,
        })
    }
}
