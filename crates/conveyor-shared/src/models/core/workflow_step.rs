//! Workflow step rows: one node of a task's DAG.
//!
//! Retry bookkeeping (`attempts`, `last_attempted_at`, `backoff_request_seconds`)
//! and the two execution flags live here; `processed = TRUE` marks terminal
//! success and permanently excludes the step from readiness, `in_process`
//! marks a step currently claimed by an executor.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;

use super::workflow_step_transition::WorkflowStepTransition;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkflowStep {
    pub workflow_step_id: i64,
    pub task_id: i64,
    pub named_step_id: i64,
    pub name: String,
    pub attempts: i32,
    pub retry_limit: i32,
    pub retryable: bool,
    pub backoff_request_seconds: Option<i32>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub processed: bool,
    pub in_process: bool,
    pub inputs: Option<Value>,
    pub results: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWorkflowStep {
    pub task_id: i64,
    pub named_step_id: i64,
    pub name: String,
    pub retry_limit: i32,
    pub retryable: bool,
    pub inputs: Option<Value>,
}

impl WorkflowStep {
    pub async fn create<'e, E>(executor: E, new: NewWorkflowStep) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as(
            r#"
            INSERT INTO conveyor.workflow_steps
                (task_id, named_step_id, name, retry_limit, retryable, inputs)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(new.task_id)
        .bind(new.named_step_id)
        .bind(new.name)
        .bind(new.retry_limit)
        .bind(new.retryable)
        .bind(new.inputs)
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_id<'e, E>(
        executor: E,
        workflow_step_id: i64,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as("SELECT * FROM conveyor.workflow_steps WHERE workflow_step_id = $1")
            .bind(workflow_step_id)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_by_ids(pool: &PgPool, ids: &[i64]) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM conveyor.workflow_steps \
             WHERE workflow_step_id = ANY($1) ORDER BY workflow_step_id",
        )
        .bind(ids)
        .fetch_all(pool)
        .await
    }

    pub async fn find_step_by_name(
        pool: &PgPool,
        task_id: i64,
        name: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM conveyor.workflow_steps WHERE task_id = $1 AND name = $2")
            .bind(task_id)
            .bind(name)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_by_task(pool: &PgPool, task_id: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM conveyor.workflow_steps \
             WHERE task_id = $1 ORDER BY workflow_step_id",
        )
        .bind(task_id)
        .fetch_all(pool)
        .await
    }

    pub async fn get_current_state(&self, pool: &PgPool) -> Result<Option<String>, sqlx::Error> {
        let current = WorkflowStepTransition::get_current(pool, self.workflow_step_id).await?;
        Ok(current.map(|t| t.to_state))
    }

    /// Direct parents of this step, via incoming edges.
    pub async fn parents(&self, pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT p.* FROM conveyor.workflow_steps p
            JOIN conveyor.workflow_step_edges e ON e.from_step_id = p.workflow_step_id
            WHERE e.to_step_id = $1
            ORDER BY p.workflow_step_id
            "#,
        )
        .bind(self.workflow_step_id)
        .fetch_all(pool)
        .await
    }

    /// Results of every parent step keyed by parent name; the handler-input
    /// shape for `upstream_results`.
    pub async fn parent_results(
        &self,
        pool: &PgPool,
    ) -> Result<HashMap<String, Value>, sqlx::Error> {
        let rows: Vec<(String, Option<Value>)> = sqlx::query_as(
            r#"
            SELECT p.name, p.results FROM conveyor.workflow_steps p
            JOIN conveyor.workflow_step_edges e ON e.from_step_id = p.workflow_step_id
            WHERE e.to_step_id = $1
            "#,
        )
        .bind(self.workflow_step_id)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, results)| (name, results.unwrap_or(Value::Null)))
            .collect())
    }

    /// Mark the step terminally successful and persist its results. Does not
    /// touch the transition log; callers pair this with a `complete`
    /// transition in the same transaction (see the executor) or use it from
    /// test fixtures.
    pub async fn mark_processed(
        &mut self,
        pool: &PgPool,
        results: Option<Value>,
    ) -> Result<(), sqlx::Error> {
        let updated: Self = sqlx::query_as(
            r#"
            UPDATE conveyor.workflow_steps
            SET processed = TRUE, in_process = FALSE, results = $2, updated_at = NOW()
            WHERE workflow_step_id = $1
            RETURNING *
            "#,
        )
        .bind(self.workflow_step_id)
        .bind(results)
        .fetch_one(pool)
        .await?;
        *self = updated;
        Ok(())
    }
}
