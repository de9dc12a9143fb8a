//! Append-only audit rows for workflow step state.
//!
//! Mirrors `TaskTransition`; the readiness engine reads these rows through
//! the `most_recent` partial index (current state) and through the
//! unfiltered error-transition index (`last_failure_at`).

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgExecutor;
use sqlx::{PgConnection, PgPool};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkflowStepTransition {
    pub workflow_step_transition_id: i64,
    pub workflow_step_id: i64,
    pub sort_key: i32,
    pub from_state: Option<String>,
    pub to_state: String,
    pub metadata: Option<Value>,
    pub most_recent: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWorkflowStepTransition {
    pub workflow_step_id: i64,
    pub from_state: Option<String>,
    pub to_state: String,
    pub metadata: Option<Value>,
}

impl WorkflowStepTransition {
    pub async fn create(pool: &PgPool, new: NewWorkflowStepTransition) -> Result<Self, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let transition = Self::create_in(&mut tx, new).await?;
        tx.commit().await?;
        Ok(transition)
    }

    /// Append a transition within an existing transaction, serialized by a
    /// row lock on the owning step.
    pub async fn create_in(
        conn: &mut PgConnection,
        new: NewWorkflowStepTransition,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query(
            "SELECT workflow_step_id FROM conveyor.workflow_steps \
             WHERE workflow_step_id = $1 FOR UPDATE",
        )
        .bind(new.workflow_step_id)
        .fetch_one(&mut *conn)
        .await?;

        sqlx::query(
            "UPDATE conveyor.workflow_step_transitions SET most_recent = FALSE \
             WHERE workflow_step_id = $1 AND most_recent",
        )
        .bind(new.workflow_step_id)
        .execute(&mut *conn)
        .await?;

        sqlx::query_as(
            r#"
            INSERT INTO conveyor.workflow_step_transitions
                (workflow_step_id, sort_key, from_state, to_state, metadata, most_recent)
            SELECT $1, COALESCE(MAX(sort_key), 0) + 1, $2, $3, $4, TRUE
            FROM conveyor.workflow_step_transitions
            WHERE workflow_step_id = $1
            RETURNING *
            "#,
        )
        .bind(new.workflow_step_id)
        .bind(new.from_state)
        .bind(new.to_state)
        .bind(new.metadata)
        .fetch_one(&mut *conn)
        .await
    }

    pub async fn get_current<'e, E>(
        executor: E,
        workflow_step_id: i64,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            "SELECT * FROM conveyor.workflow_step_transitions \
             WHERE workflow_step_id = $1 AND most_recent",
        )
        .bind(workflow_step_id)
        .fetch_optional(executor)
        .await
    }

    pub async fn list_for_step(
        pool: &PgPool,
        workflow_step_id: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM conveyor.workflow_step_transitions \
             WHERE workflow_step_id = $1 ORDER BY sort_key",
        )
        .bind(workflow_step_id)
        .fetch_all(pool)
        .await
    }
}
