pub mod execution_context;
pub mod readiness_summary;
pub mod step_readiness;

pub use execution_context::{
    ExecutionStatus, HealthStatus, RecommendedAction, TaskExecutionContext,
};
pub use readiness_summary::TaskReadinessSummary;
pub use step_readiness::StepReadinessStatus;
