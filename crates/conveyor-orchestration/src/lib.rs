//! # conveyor-orchestration
//!
//! The orchestration loop for the conveyor workflow core: viable step
//! discovery, step execution, backoff scheduling, task finalization,
//! re-enqueueing, and the queue-driven coordinator that binds them.

pub mod orchestration;
pub mod telemetry;

pub use orchestration::{
    BackoffCalculator, CreatedTask, FinalizationAction, FinalizationResult, StepExecutionOutcome,
    StepExecutor, StepOutcome, TaskFinalizer, TaskInitializer, TaskQueueProcessor, TaskReenqueuer,
    ViableStep, ViableStepDiscovery, WorkflowCoordinator,
};
