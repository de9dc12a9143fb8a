//! Task rows: one row per workflow instance.
//!
//! A task's current state is never stored on this row; it is derived from the
//! transition log. The row carries identity, the template reference, and the
//! opaque context document handed to every step handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;
use uuid::Uuid;

use super::task_transition::TaskTransition;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub task_id: i64,
    pub named_task_id: i64,
    pub context: Option<Value>,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub named_task_id: i64,
    pub context: Option<Value>,
    pub correlation_id: Uuid,
}

impl Task {
    pub async fn create<'e, E>(executor: E, new: NewTask) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r#"
            INSERT INTO conveyor.tasks (named_task_id, context, correlation_id)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(new.named_task_id)
        .bind(new.context)
        .bind(new.correlation_id)
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, task_id: i64) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as("SELECT * FROM conveyor.tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(executor)
            .await
    }

    /// Current state as persisted text; `None` when no transition exists yet.
    pub async fn get_current_state(&self, pool: &PgPool) -> Result<Option<String>, sqlx::Error> {
        let current = TaskTransition::get_current(pool, self.task_id).await?;
        Ok(current.map(|t| t.to_state))
    }

    /// The context document, defaulting to an empty object for handler input
    /// construction.
    pub fn context_or_empty(&self) -> Value {
        self.context.clone().unwrap_or_else(|| Value::Object(Default::default()))
    }
}
