//! Guarded, audited task transitions.
//!
//! The database is authoritative: current state is always read from the
//! `most_recent` transition row, never cached. Appends serialize on a row
//! lock held by `TaskTransition::create_in`, so concurrent transition
//! attempts resolve to one winner; the loser re-reads and either no-ops
//! (already in the target state) or fails loudly (illegal from the new
//! state).

use std::str::FromStr;
use std::sync::Arc;

use serde_json::json;
use sqlx::PgConnection;
use tracing::debug;

use crate::errors::StateMachineError;
use crate::models::core::task_transition::{NewTaskTransition, TaskTransition};
use crate::system_context::SystemContext;

use super::events::TaskEvent;
use super::states::TaskState;

#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    task_id: i64,
    context: Arc<SystemContext>,
}

impl TaskStateMachine {
    pub fn new(task_id: i64, context: Arc<SystemContext>) -> Self {
        Self { task_id, context }
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    /// Current state; a task with no transitions reads as pending.
    pub async fn current_state(&self) -> Result<TaskState, StateMachineError> {
        let current = TaskTransition::get_current(self.context.database_pool(), self.task_id)
            .await?;
        match current {
            Some(transition) => TaskState::from_str(&transition.to_state),
            None => Ok(TaskState::Pending),
        }
    }

    /// Apply an event in its own transaction. Returns `true` when a
    /// transition row was written, `false` for the idempotent no-op (already
    /// in the target state).
    pub async fn transition(&mut self, event: TaskEvent) -> Result<bool, StateMachineError> {
        let mut tx = self.context.database_pool().begin().await?;
        let applied = self.transition_in(&mut tx, event).await?;
        tx.commit().await?;
        Ok(applied)
    }

    /// Apply an event on an existing transaction; the finalizer uses this to
    /// pair a guard re-read with the terminal transition.
    pub async fn transition_in(
        &mut self,
        conn: &mut PgConnection,
        event: TaskEvent,
    ) -> Result<bool, StateMachineError> {
        let current = match TaskTransition::get_current(&mut *conn, self.task_id).await? {
            Some(transition) => TaskState::from_str(&transition.to_state)?,
            None => TaskState::Pending,
        };

        let target = Self::target_state(&event);
        if current == target {
            debug!(
                task_id = self.task_id,
                state = %current,
                "Task already in target state; transition is a no-op"
            );
            return Ok(false);
        }

        if current.is_terminal() {
            return Err(StateMachineError::TerminalState {
                entity: "task",
                entity_id: self.task_id,
                state: current.to_string(),
            });
        }
        if !Self::can_transition(current, target) {
            return Err(StateMachineError::InvalidTransition {
                entity: "task",
                from: current.to_string(),
                to: target.to_string(),
            });
        }

        TaskTransition::create_in(
            conn,
            NewTaskTransition {
                task_id: self.task_id,
                from_state: Some(current.to_string()),
                to_state: target.to_string(),
                metadata: Self::metadata_for(&event),
            },
        )
        .await?;

        self.after_transition(current, target);
        Ok(true)
    }

    /// Idempotent shortcut: transition toward `target` if an event maps
    /// there, no-op when already there.
    pub async fn safe_transition_to(
        &mut self,
        target: TaskState,
    ) -> Result<bool, StateMachineError> {
        let current = self.current_state().await?;
        if current == target {
            return Ok(false);
        }
        let event = match target {
            TaskState::InProgress => TaskEvent::Start,
            TaskState::Complete => TaskEvent::Complete,
            TaskState::Error => TaskEvent::Fail("transitioned by safe_transition_to".to_string()),
            TaskState::Pending => TaskEvent::Reenqueue,
            TaskState::Cancelled => TaskEvent::Cancel,
            TaskState::ResolvedManually => TaskEvent::ResolveManually,
        };
        self.transition(event).await
    }

    fn target_state(event: &TaskEvent) -> TaskState {
        match event {
            TaskEvent::Start => TaskState::InProgress,
            TaskEvent::Complete => TaskState::Complete,
            TaskEvent::Fail(_) => TaskState::Error,
            TaskEvent::Reenqueue | TaskEvent::Retry => TaskState::Pending,
            TaskEvent::Cancel => TaskState::Cancelled,
            TaskEvent::ResolveManually => TaskState::ResolvedManually,
        }
    }

    /// The allowed-transition table.
    fn can_transition(from: TaskState, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (from, to),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Complete)
                | (InProgress, Error)
                | (InProgress, Pending)
                | (InProgress, Cancelled)
                | (Error, Pending)
                | (Error, Cancelled)
                | (Error, ResolvedManually)
        )
    }

    fn metadata_for(event: &TaskEvent) -> Option<serde_json::Value> {
        match event {
            TaskEvent::Fail(reason) => Some(json!({ "error": reason })),
            TaskEvent::Reenqueue => Some(json!({ "reason": "reenqueue" })),
            TaskEvent::Retry => Some(json!({ "reason": "manual_retry" })),
            _ => None,
        }
    }

    fn after_transition(&self, from: TaskState, to: TaskState) {
        debug!(
            task_id = self.task_id,
            processor_id = %self.context.processor_id(),
            from = %from,
            to = %to,
            "Task transition applied"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::factories::{SqlxFactory, TaskFactory};
    use sqlx::PgPool;

    async fn machine_for(
        pool: &PgPool,
        factory: TaskFactory,
    ) -> Result<TaskStateMachine, anyhow::Error> {
        let task = factory.create(pool).await?;
        let context = Arc::new(SystemContext::with_pool(pool.clone()).await?);
        Ok(TaskStateMachine::new(task.task_id, context))
    }

    #[sqlx::test(migrator = "crate::database::migrator::MIGRATOR")]
    async fn start_moves_pending_task_to_in_progress(pool: PgPool) -> Result<(), anyhow::Error> {
        let mut machine = machine_for(&pool, TaskFactory::new().pending()).await?;

        assert_eq!(machine.current_state().await?, TaskState::Pending);
        assert!(machine.transition(TaskEvent::Start).await?);
        assert_eq!(machine.current_state().await?, TaskState::InProgress);
        Ok(())
    }

    #[sqlx::test(migrator = "crate::database::migrator::MIGRATOR")]
    async fn same_state_transition_is_silent_no_op(pool: PgPool) -> Result<(), anyhow::Error> {
        let mut machine = machine_for(&pool, TaskFactory::new().in_progress()).await?;

        let applied = machine.transition(TaskEvent::Start).await?;
        assert!(!applied, "no-op must signal false, not error");

        // No duplicate row was appended.
        let history =
            TaskTransition::list_for_task(&pool, machine.task_id()).await?;
        assert_eq!(history.len(), 2);
        Ok(())
    }

    #[sqlx::test(migrator = "crate::database::migrator::MIGRATOR")]
    async fn illegal_transition_fails_loudly(pool: PgPool) -> Result<(), anyhow::Error> {
        let mut machine = machine_for(&pool, TaskFactory::new().pending()).await?;

        // pending -> complete skips in_progress and is not in the table.
        let result = machine.transition(TaskEvent::Complete).await;
        assert!(matches!(
            result,
            Err(StateMachineError::InvalidTransition { .. })
        ));
        assert_eq!(machine.current_state().await?, TaskState::Pending);
        Ok(())
    }

    #[sqlx::test(migrator = "crate::database::migrator::MIGRATOR")]
    async fn terminal_state_admits_no_further_transitions(
        pool: PgPool,
    ) -> Result<(), anyhow::Error> {
        let mut machine = machine_for(&pool, TaskFactory::new().in_progress()).await?;
        assert!(machine.transition(TaskEvent::Complete).await?);

        let result = machine.transition(TaskEvent::Start).await;
        assert!(matches!(
            result,
            Err(StateMachineError::TerminalState { .. })
        ));

        // ...but re-asserting the terminal state itself is still a no-op.
        assert!(!machine.transition(TaskEvent::Complete).await?);
        Ok(())
    }

    #[sqlx::test(migrator = "crate::database::migrator::MIGRATOR")]
    async fn error_task_can_be_retried_to_pending(pool: PgPool) -> Result<(), anyhow::Error> {
        let mut machine = machine_for(&pool, TaskFactory::new().in_progress()).await?;
        assert!(machine
            .transition(TaskEvent::Fail("steps exhausted".to_string()))
            .await?);
        assert_eq!(machine.current_state().await?, TaskState::Error);

        assert!(machine.transition(TaskEvent::Retry).await?);
        assert_eq!(machine.current_state().await?, TaskState::Pending);
        Ok(())
    }

    #[sqlx::test(migrator = "crate::database::migrator::MIGRATOR")]
    async fn audit_log_is_totally_ordered_with_one_most_recent(
        pool: PgPool,
    ) -> Result<(), anyhow::Error> {
        let mut machine = machine_for(&pool, TaskFactory::new().pending()).await?;
        machine.transition(TaskEvent::Start).await?;
        machine.transition(TaskEvent::Reenqueue).await?;
        machine.transition(TaskEvent::Start).await?;
        machine.transition(TaskEvent::Complete).await?;

        let history = TaskTransition::list_for_task(&pool, machine.task_id()).await?;
        assert_eq!(history.len(), 5);
        let sort_keys: Vec<i32> = history.iter().map(|t| t.sort_key).collect();
        assert_eq!(sort_keys, vec![1, 2, 3, 4, 5]);

        let most_recent: Vec<&TaskTransition> =
            history.iter().filter(|t| t.most_recent).collect();
        assert_eq!(most_recent.len(), 1);
        assert_eq!(most_recent[0].sort_key, 5);
        assert_eq!(most_recent[0].to_state, "complete");
        Ok(())
    }

    #[sqlx::test(migrator = "crate::database::migrator::MIGRATOR")]
    async fn safe_transition_to_is_idempotent(pool: PgPool) -> Result<(), anyhow::Error> {
        let mut machine = machine_for(&pool, TaskFactory::new().pending()).await?;

        assert!(machine.safe_transition_to(TaskState::InProgress).await?);
        assert!(!machine.safe_transition_to(TaskState::InProgress).await?);
        assert_eq!(machine.current_state().await?, TaskState::InProgress);
        Ok(())
    }
}
