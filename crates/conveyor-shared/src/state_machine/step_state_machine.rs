//! Guarded, audited workflow step transitions.
//!
//! Retries execute directly from `error`: the executor's Start event claims
//! a step out of either `pending` or `error`. The `error -> pending` reset
//! exists for the explicit retry-scheduling path and leaves the prior error
//! transition in the log, which is exactly what the readiness engine's
//! `last_failure_at` lookup depends on.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::json;
use sqlx::PgConnection;
use tracing::debug;

use crate::errors::StateMachineError;
use crate::models::core::workflow_step_transition::{
    NewWorkflowStepTransition, WorkflowStepTransition,
};
use crate::system_context::SystemContext;

use super::events::StepEvent;
use super::states::WorkflowStepState;

#[derive(Debug, Clone)]
pub struct StepStateMachine {
    workflow_step_id: i64,
    context: Arc<SystemContext>,
}

impl StepStateMachine {
    pub fn new(workflow_step_id: i64, context: Arc<SystemContext>) -> Self {
        Self {
            workflow_step_id,
            context,
        }
    }

    pub fn workflow_step_id(&self) -> i64 {
        self.workflow_step_id
    }

    pub async fn current_state(&self) -> Result<WorkflowStepState, StateMachineError> {
        let current = WorkflowStepTransition::get_current(
            self.context.database_pool(),
            self.workflow_step_id,
        )
        .await?;
        match current {
            Some(transition) => WorkflowStepState::from_str(&transition.to_state),
            None => Ok(WorkflowStepState::Pending),
        }
    }

    pub async fn transition(&mut self, event: StepEvent) -> Result<bool, StateMachineError> {
        let mut tx = self.context.database_pool().begin().await?;
        let applied = self.transition_in(&mut tx, event).await?;
        tx.commit().await?;
        Ok(applied)
    }

    /// Apply an event on an existing transaction. The executor pairs this
    /// with the attempt-bookkeeping update so claim and transition commit
    /// atomically.
    pub async fn transition_in(
        &mut self,
        conn: &mut PgConnection,
        event: StepEvent,
    ) -> Result<bool, StateMachineError> {
        let current =
            match WorkflowStepTransition::get_current(&mut *conn, self.workflow_step_id).await? {
                Some(transition) => WorkflowStepState::from_str(&transition.to_state)?,
                None => WorkflowStepState::Pending,
            };

        let target = Self::target_state(&event);
        if current == target {
            debug!(
                workflow_step_id = self.workflow_step_id,
                state = %current,
                "Step already in target state; transition is a no-op"
            );
            return Ok(false);
        }

        if current.is_terminal() {
            return Err(StateMachineError::TerminalState {
                entity: "workflow_step",
                entity_id: self.workflow_step_id,
                state: current.to_string(),
            });
        }
        if !Self::can_transition(current, target) {
            return Err(StateMachineError::InvalidTransition {
                entity: "workflow_step",
                from: current.to_string(),
                to: target.to_string(),
            });
        }

        WorkflowStepTransition::create_in(
            conn,
            NewWorkflowStepTransition {
                workflow_step_id: self.workflow_step_id,
                from_state: Some(current.to_string()),
                to_state: target.to_string(),
                metadata: Self::metadata_for(&event),
            },
        )
        .await?;

        self.after_transition(current, target);
        Ok(true)
    }

    fn target_state(event: &StepEvent) -> WorkflowStepState {
        match event {
            StepEvent::Start => WorkflowStepState::InProgress,
            StepEvent::Complete(_) => WorkflowStepState::Complete,
            StepEvent::Fail(_) => WorkflowStepState::Error,
            StepEvent::Retry => WorkflowStepState::Pending,
            StepEvent::ResolveManually => WorkflowStepState::ResolvedManually,
        }
    }

    fn can_transition(from: WorkflowStepState, to: WorkflowStepState) -> bool {
        use WorkflowStepState::*;
        matches!(
            (from, to),
            (Pending, InProgress)
                | (Error, InProgress)
                | (InProgress, Complete)
                | (InProgress, Error)
                | (Error, Pending)
                | (Error, ResolvedManually)
        )
    }

    fn metadata_for(event: &StepEvent) -> Option<serde_json::Value> {
        match event {
            StepEvent::Complete(Some(results)) => Some(json!({ "results": results })),
            StepEvent::Fail(error) => Some(json!({ "error": error })),
            StepEvent::Retry => Some(json!({ "reason": "retry_scheduled" })),
            _ => None,
        }
    }

    fn after_transition(&self, from: WorkflowStepState, to: WorkflowStepState) {
        debug!(
            workflow_step_id = self.workflow_step_id,
            processor_id = %self.context.processor_id(),
            from = %from,
            to = %to,
            "Step transition applied"
        );
    }
}
