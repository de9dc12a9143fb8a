//! Typed wrappers around the SQL-resident readiness engine.
//!
//! Correctness lives in the database functions; this module only binds
//! parameters and maps rows. Readiness for a single task executes in
//! O(steps per task): current-state lookups ride the `most_recent` partial
//! indexes and the step scan filters on `processed` / `in_process` before
//! touching any history.

use std::collections::HashMap;

use sqlx::{PgConnection, PgPool};

use crate::models::orchestration::{
    StepReadinessStatus, TaskExecutionContext, TaskReadinessSummary,
};

#[derive(Debug, Clone)]
pub struct SqlFunctionExecutor {
    pool: PgPool,
}

impl SqlFunctionExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Readiness rows for one task, optionally restricted to a caller-provided
    /// subset of step ids.
    pub async fn get_step_readiness_status(
        &self,
        task_id: i64,
        step_ids: Option<&[i64]>,
    ) -> Result<Vec<StepReadinessStatus>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM conveyor.get_step_readiness_status($1, $2)")
            .bind(task_id)
            .bind(step_ids)
            .fetch_all(&self.pool)
            .await
    }

    /// Batch form: same columns, grouped by task id. Amortizes per-call
    /// overhead for schedulers scanning many tasks.
    pub async fn get_step_readiness_status_batch(
        &self,
        task_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<StepReadinessStatus>>, sqlx::Error> {
        let rows: Vec<StepReadinessStatus> =
            sqlx::query_as("SELECT * FROM conveyor.get_step_readiness_status_batch($1)")
                .bind(task_ids)
                .fetch_all(&self.pool)
                .await?;

        let mut grouped: HashMap<i64, Vec<StepReadinessStatus>> = HashMap::new();
        for row in rows {
            grouped.entry(row.task_id).or_default().push(row);
        }
        Ok(grouped)
    }

    /// Task execution context roll-up; `None` when the task does not exist.
    pub async fn get_task_execution_context(
        &self,
        task_id: i64,
    ) -> Result<Option<TaskExecutionContext>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM conveyor.get_task_execution_context($1)")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Execution context read on an existing connection. The finalizer uses
    /// this to re-read the context inside the transaction that performs a
    /// terminal transition, closing the race with a concurrent worker
    /// completing the final step.
    pub async fn get_task_execution_context_in(
        conn: &mut PgConnection,
        task_id: i64,
    ) -> Result<Option<TaskExecutionContext>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM conveyor.get_task_execution_context($1)")
            .bind(task_id)
            .fetch_optional(conn)
            .await
    }

    /// Longest-path dependency level per step (roots are level 0, MAX over
    /// converging paths).
    pub async fn get_dependency_levels(
        &self,
        task_id: i64,
    ) -> Result<HashMap<i64, i32>, sqlx::Error> {
        let rows: Vec<(i64, i32)> =
            sqlx::query_as("SELECT * FROM conveyor.calculate_dependency_levels($1)")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    /// Compact summary computed from the readiness rows.
    pub async fn get_task_readiness_summary(
        &self,
        task_id: i64,
    ) -> Result<TaskReadinessSummary, sqlx::Error> {
        let rows = self.get_step_readiness_status(task_id, None).await?;
        Ok(TaskReadinessSummary::from_readiness(task_id, &rows))
    }
}
