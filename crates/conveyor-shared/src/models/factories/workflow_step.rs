//! Workflow step fixtures: a step row, its dependency edges, retry
//! bookkeeping, and the transition chain that puts it in the requested state.

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::errors::ConveyorResult;
use crate::models::core::workflow_step::{NewWorkflowStep, WorkflowStep};
use crate::models::core::workflow_step_edge::WorkflowStepEdge;
use crate::models::core::workflow_step_transition::{
    NewWorkflowStepTransition, WorkflowStepTransition,
};
use crate::state_machine::states::WorkflowStepState;

use super::base::SqlxFactory;

#[derive(Debug, Clone)]
pub struct WorkflowStepFactory {
    task_id: i64,
    named_step_id: i64,
    name: String,
    retry_limit: i32,
    retryable: bool,
    attempts: i32,
    backoff_request_seconds: Option<i32>,
    state: WorkflowStepState,
    parents: Vec<i64>,
    inputs: Option<Value>,
}

impl WorkflowStepFactory {
    pub fn new() -> Self {
        Self {
            task_id: 0,
            named_step_id: 1,
            name: "step".to_string(),
            retry_limit: 3,
            retryable: true,
            attempts: 0,
            backoff_request_seconds: None,
            state: WorkflowStepState::Pending,
            parents: Vec::new(),
            inputs: None,
        }
    }

    pub fn for_task(mut self, task_id: i64) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_named_step_id(mut self, named_step_id: i64) -> Self {
        self.named_step_id = named_step_id;
        self
    }

    pub fn with_parent(mut self, parent_step_id: i64) -> Self {
        self.parents.push(parent_step_id);
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: i32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn with_attempts(mut self, attempts: i32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_backoff_request(mut self, seconds: i32) -> Self {
        self.backoff_request_seconds = Some(seconds);
        self
    }

    pub fn with_state(mut self, state: WorkflowStepState) -> Self {
        self.state = state;
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Walk an existing step to `complete` through the state machine chain
    /// and mark it processed; the fixture equivalent of a handler finishing.
    pub async fn complete_existing(pool: &PgPool, workflow_step_id: i64) -> ConveyorResult<()> {
        let mut step = WorkflowStep::find_by_id(pool, workflow_step_id)
            .await?
            .ok_or_else(|| sqlx::Error::RowNotFound)?;

        let current = step
            .get_current_state(pool)
            .await?
            .unwrap_or_else(|| "pending".to_string());

        if current == "pending" {
            WorkflowStepTransition::create(
                pool,
                NewWorkflowStepTransition {
                    workflow_step_id,
                    from_state: Some("pending".to_string()),
                    to_state: "in_progress".to_string(),
                    metadata: None,
                },
            )
            .await?;
        }
        if current != "complete" {
            WorkflowStepTransition::create(
                pool,
                NewWorkflowStepTransition {
                    workflow_step_id,
                    from_state: Some("in_progress".to_string()),
                    to_state: "complete".to_string(),
                    metadata: None,
                },
            )
            .await?;
        }

        step.mark_processed(pool, Some(json!({"ok": true}))).await?;
        Ok(())
    }
}

impl Default for WorkflowStepFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SqlxFactory<WorkflowStep> for WorkflowStepFactory {
    async fn create(&self, pool: &PgPool) -> ConveyorResult<WorkflowStep> {
        let step = WorkflowStep::create(
            pool,
            NewWorkflowStep {
                task_id: self.task_id,
                named_step_id: self.named_step_id,
                name: self.name.clone(),
                retry_limit: self.retry_limit,
                retryable: self.retryable,
                inputs: self.inputs.clone(),
            },
        )
        .await?;

        for parent_id in &self.parents {
            WorkflowStepEdge::create(pool, *parent_id, step.workflow_step_id).await?;
        }

        // Retry bookkeeping that only exists after attempts have been made.
        if self.attempts > 0 || self.backoff_request_seconds.is_some() {
            sqlx::query(
                "UPDATE conveyor.workflow_steps \
                 SET attempts = $2, \
                     last_attempted_at = CASE WHEN $2 > 0 THEN NOW() ELSE last_attempted_at END, \
                     backoff_request_seconds = $3, \
                     updated_at = NOW() \
                 WHERE workflow_step_id = $1",
            )
            .bind(step.workflow_step_id)
            .bind(self.attempts)
            .bind(self.backoff_request_seconds)
            .execute(pool)
            .await
            .map_err(crate::errors::ConveyorError::from)?;
        }

        // Transition chain for the requested state.
        let chain: &[(&str, Option<&str>)] = match self.state {
            WorkflowStepState::Pending => &[("pending", None)],
            WorkflowStepState::InProgress => {
                &[("pending", None), ("in_progress", Some("pending"))]
            }
            WorkflowStepState::Complete => &[
                ("pending", None),
                ("in_progress", Some("pending")),
                ("complete", Some("in_progress")),
            ],
            WorkflowStepState::Error => &[
                ("pending", None),
                ("in_progress", Some("pending")),
                ("error", Some("in_progress")),
            ],
            WorkflowStepState::ResolvedManually => &[
                ("pending", None),
                ("in_progress", Some("pending")),
                ("error", Some("in_progress")),
                ("resolved_manually", Some("error")),
            ],
        };

        for (to_state, from_state) in chain {
            WorkflowStepTransition::create(
                pool,
                NewWorkflowStepTransition {
                    workflow_step_id: step.workflow_step_id,
                    from_state: from_state.map(|s| s.to_string()),
                    to_state: to_state.to_string(),
                    metadata: None,
                },
            )
            .await?;
        }

        // Flags consistent with the requested state.
        match self.state {
            WorkflowStepState::InProgress => {
                sqlx::query(
                    "UPDATE conveyor.workflow_steps SET in_process = TRUE, updated_at = NOW() \
                     WHERE workflow_step_id = $1",
                )
                .bind(step.workflow_step_id)
                .execute(pool)
                .await
                .map_err(crate::errors::ConveyorError::from)?;
            }
            WorkflowStepState::Complete | WorkflowStepState::ResolvedManually => {
                sqlx::query(
                    "UPDATE conveyor.workflow_steps \
                     SET processed = TRUE, in_process = FALSE, updated_at = NOW() \
                     WHERE workflow_step_id = $1",
                )
                .bind(step.workflow_step_id)
                .execute(pool)
                .await
                .map_err(crate::errors::ConveyorError::from)?;
            }
            _ => {}
        }

        let step = WorkflowStep::find_by_id(pool, step.workflow_step_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        Ok(step)
    }
}
