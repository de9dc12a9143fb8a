//! Dependency edges between steps of the same task. The edge set of any task
//! must form a DAG; the creation path validates acyclicity before any edge
//! row is written (see the task initializer).

use chrono::{DateTime, Utc};
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkflowStepEdge {
    pub from_step_id: i64,
    pub to_step_id: i64,
    pub created_at: DateTime<Utc>,
}

impl WorkflowStepEdge {
    pub async fn create<'e, E>(
        executor: E,
        from_step_id: i64,
        to_step_id: i64,
    ) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r#"
            INSERT INTO conveyor.workflow_step_edges (from_step_id, to_step_id)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(from_step_id)
        .bind(to_step_id)
        .fetch_one(executor)
        .await
    }

    /// All edges within one task.
    pub async fn list_by_task(pool: &PgPool, task_id: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT e.* FROM conveyor.workflow_step_edges e
            JOIN conveyor.workflow_steps ws ON ws.workflow_step_id = e.from_step_id
            WHERE ws.task_id = $1
            ORDER BY e.from_step_id, e.to_step_id
            "#,
        )
        .bind(task_id)
        .fetch_all(pool)
        .await
    }
}
