//! Append-only audit rows for task state.
//!
//! Appending a transition atomically inserts the new row with
//! `most_recent = TRUE` and clears the flag on the previous current row, all
//! under a row lock on the owning task. The unique partial index on
//! `(task_id) WHERE most_recent` turns any bookkeeping bug into a constraint
//! violation.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgExecutor;
use sqlx::{PgConnection, PgPool};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskTransition {
    pub task_transition_id: i64,
    pub task_id: i64,
    pub sort_key: i32,
    pub from_state: Option<String>,
    pub to_state: String,
    pub metadata: Option<Value>,
    pub most_recent: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTaskTransition {
    pub task_id: i64,
    pub from_state: Option<String>,
    pub to_state: String,
    pub metadata: Option<Value>,
}

impl TaskTransition {
    /// Append a transition in its own transaction.
    pub async fn create(pool: &PgPool, new: NewTaskTransition) -> Result<Self, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let transition = Self::create_in(&mut tx, new).await?;
        tx.commit().await?;
        Ok(transition)
    }

    /// Append a transition within an existing transaction.
    ///
    /// Locks the owning task row so concurrent appends for the same task
    /// serialize; the loser observes the winner's row once it acquires the
    /// lock. Errors with `RowNotFound` if the task does not exist.
    pub async fn create_in(
        conn: &mut PgConnection,
        new: NewTaskTransition,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query("SELECT task_id FROM conveyor.tasks WHERE task_id = $1 FOR UPDATE")
            .bind(new.task_id)
            .fetch_one(&mut *conn)
            .await?;

        sqlx::query(
            "UPDATE conveyor.task_transitions SET most_recent = FALSE \
             WHERE task_id = $1 AND most_recent",
        )
        .bind(new.task_id)
        .execute(&mut *conn)
        .await?;

        sqlx::query_as(
            r#"
            INSERT INTO conveyor.task_transitions
                (task_id, sort_key, from_state, to_state, metadata, most_recent)
            SELECT $1, COALESCE(MAX(sort_key), 0) + 1, $2, $3, $4, TRUE
            FROM conveyor.task_transitions
            WHERE task_id = $1
            RETURNING *
            "#,
        )
        .bind(new.task_id)
        .bind(new.from_state)
        .bind(new.to_state)
        .bind(new.metadata)
        .fetch_one(&mut *conn)
        .await
    }

    /// Current transition for a task: the single `most_recent` row. Never
    /// computed via `ORDER BY created_at` at query time.
    pub async fn get_current<'e, E>(executor: E, task_id: i64) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            "SELECT * FROM conveyor.task_transitions \
             WHERE task_id = $1 AND most_recent",
        )
        .bind(task_id)
        .fetch_optional(executor)
        .await
    }

    /// Full audit history, oldest first.
    pub async fn list_for_task(pool: &PgPool, task_id: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM conveyor.task_transitions \
             WHERE task_id = $1 ORDER BY sort_key",
        )
        .bind(task_id)
        .fetch_all(pool)
        .await
    }
}
