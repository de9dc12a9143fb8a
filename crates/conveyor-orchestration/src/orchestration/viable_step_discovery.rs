//! Viable step discovery: a thin read over the readiness engine.
//!
//! Returns fully-hydrated step records for every row the SQL functions mark
//! `ready_for_execution`, plus the readiness metadata the executor needs to
//! build handler inputs. All decisions live in SQL; this module only joins
//! rows back to step records.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use conveyor_shared::database::SqlFunctionExecutor;
use conveyor_shared::errors::OrchestrationResult;
use conveyor_shared::models::orchestration::{
    StepReadinessStatus, TaskExecutionContext, TaskReadinessSummary,
};
use conveyor_shared::models::WorkflowStep;
use conveyor_shared::resilience::{execute_with_retry, RetryPolicy};
use conveyor_shared::system_context::SystemContext;

/// A step the readiness engine cleared for execution right now.
#[derive(Debug, Clone)]
pub struct ViableStep {
    pub step: WorkflowStep,
    pub readiness: StepReadinessStatus,
}

#[derive(Debug, Clone)]
pub struct ViableStepDiscovery {
    context: Arc<SystemContext>,
    sql_executor: SqlFunctionExecutor,
    retry_policy: RetryPolicy,
}

impl ViableStepDiscovery {
    pub fn new(context: Arc<SystemContext>) -> Self {
        let sql_executor = SqlFunctionExecutor::new(context.database_pool().clone());
        Self {
            context,
            sql_executor,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Ready steps for a task, optionally restricted to a caller-provided
    /// subset of step ids.
    pub async fn find_viable_steps(
        &self,
        task_id: i64,
        step_ids: Option<&[i64]>,
    ) -> OrchestrationResult<Vec<ViableStep>> {
        let rows = execute_with_retry(&self.retry_policy, "get_step_readiness_status", || {
            self.sql_executor.get_step_readiness_status(task_id, step_ids)
        })
        .await?;

        let ready: Vec<StepReadinessStatus> = rows
            .into_iter()
            .filter(|row| row.ready_for_execution)
            .collect();
        if ready.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = ready.iter().map(|r| r.workflow_step_id).collect();
        let steps = WorkflowStep::find_by_ids(self.context.database_pool(), &ids).await?;
        let mut by_id: HashMap<i64, WorkflowStep> = steps
            .into_iter()
            .map(|s| (s.workflow_step_id, s))
            .collect();

        let viable: Vec<ViableStep> = ready
            .into_iter()
            .filter_map(|readiness| {
                by_id
                    .remove(&readiness.workflow_step_id)
                    .map(|step| ViableStep { step, readiness })
            })
            .collect();

        debug!(
            task_id,
            viable_count = viable.len(),
            "Viable step discovery complete"
        );
        Ok(viable)
    }

    pub async fn get_execution_context(
        &self,
        task_id: i64,
    ) -> OrchestrationResult<Option<TaskExecutionContext>> {
        let context = execute_with_retry(&self.retry_policy, "get_task_execution_context", || {
            self.sql_executor.get_task_execution_context(task_id)
        })
        .await?;
        Ok(context)
    }

    pub async fn get_dependency_levels(
        &self,
        task_id: i64,
    ) -> OrchestrationResult<HashMap<i64, i32>> {
        Ok(self.sql_executor.get_dependency_levels(task_id).await?)
    }

    pub async fn get_task_readiness_summary(
        &self,
        task_id: i64,
    ) -> OrchestrationResult<TaskReadinessSummary> {
        Ok(self.sql_executor.get_task_readiness_summary(task_id).await?)
    }

    pub fn sql_executor(&self) -> &SqlFunctionExecutor {
        &self.sql_executor
    }
}
