//! Task-level execution context: the readiness roll-up the finalizer
//! dispatches on, plus derived status enums.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use crate::errors::ConveyorError;

/// Derived task execution status, priority-ordered (first match wins in the
/// SQL roll-up): ready work, active work, permanent failure, completion,
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    HasReadySteps,
    Processing,
    BlockedByFailures,
    AllComplete,
    WaitingForDependencies,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::HasReadySteps => "has_ready_steps",
            ExecutionStatus::Processing => "processing",
            ExecutionStatus::BlockedByFailures => "blocked_by_failures",
            ExecutionStatus::AllComplete => "all_complete",
            ExecutionStatus::WaitingForDependencies => "waiting_for_dependencies",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ExecutionStatus {
    type Error = ConveyorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "has_ready_steps" => Ok(ExecutionStatus::HasReadySteps),
            "processing" => Ok(ExecutionStatus::Processing),
            "blocked_by_failures" => Ok(ExecutionStatus::BlockedByFailures),
            "all_complete" => Ok(ExecutionStatus::AllComplete),
            "waiting_for_dependencies" => Ok(ExecutionStatus::WaitingForDependencies),
            other => Err(ConveyorError::Validation(format!(
                "unknown execution status: {other}"
            ))),
        }
    }
}

/// 1:1 mapping from `ExecutionStatus`; kept as its own enum so callers can
/// switch on intent rather than status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    ExecuteReadySteps,
    WaitForCompletion,
    HandleFailures,
    FinalizeTask,
    WaitForDependencies,
}

impl TryFrom<String> for RecommendedAction {
    type Error = ConveyorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "execute_ready_steps" => Ok(RecommendedAction::ExecuteReadySteps),
            "wait_for_completion" => Ok(RecommendedAction::WaitForCompletion),
            "handle_failures" => Ok(RecommendedAction::HandleFailures),
            "finalize_task" => Ok(RecommendedAction::FinalizeTask),
            "wait_for_dependencies" => Ok(RecommendedAction::WaitForDependencies),
            other => Err(ConveyorError::Validation(format!(
                "unknown recommended action: {other}"
            ))),
        }
    }
}

/// Operator-facing health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Recovering,
    Blocked,
    Unknown,
}

impl TryFrom<String> for HealthStatus {
    type Error = ConveyorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "healthy" => Ok(HealthStatus::Healthy),
            "recovering" => Ok(HealthStatus::Recovering),
            "blocked" => Ok(HealthStatus::Blocked),
            "unknown" => Ok(HealthStatus::Unknown),
            other => Err(ConveyorError::Validation(format!(
                "unknown health status: {other}"
            ))),
        }
    }
}

/// The roll-up row from `conveyor.get_task_execution_context`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskExecutionContext {
    pub task_id: i64,
    pub total_steps: i64,
    pub pending_steps: i64,
    pub in_progress_steps: i64,
    pub completed_steps: i64,
    pub failed_steps: i64,
    pub ready_steps: i64,
    pub permanently_blocked_steps: i64,
    #[sqlx(try_from = "String")]
    pub execution_status: ExecutionStatus,
    #[sqlx(try_from = "String")]
    pub recommended_action: RecommendedAction,
    pub completion_percentage: BigDecimal,
    #[sqlx(try_from = "String")]
    pub health_status: HealthStatus,
}
