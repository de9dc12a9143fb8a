//! The orchestration loop and its collaborators.
//!
//! Data flow for one invocation: a worker receives a process-task message →
//! [`coordinator::WorkflowCoordinator`] asks
//! [`viable_step_discovery::ViableStepDiscovery`] for ready steps →
//! [`step_executor::StepExecutor`] claims and runs them →
//! [`task_finalizer::TaskFinalizer`] consults the execution context and
//! either terminalizes the task or hands it to
//! [`reenqueuer::TaskReenqueuer`].

pub mod backoff;
pub mod coordinator;
pub mod reenqueuer;
pub mod step_executor;
pub mod task_finalizer;
pub mod task_initialization;
pub mod task_queue_processor;
pub mod viable_step_discovery;

pub use backoff::BackoffCalculator;
pub use coordinator::WorkflowCoordinator;
pub use reenqueuer::TaskReenqueuer;
pub use step_executor::{StepExecutionOutcome, StepExecutor, StepOutcome};
pub use task_finalizer::{FinalizationAction, FinalizationResult, TaskFinalizer};
pub use task_initialization::{CreatedTask, TaskInitializer};
pub use task_queue_processor::TaskQueueProcessor;
pub use viable_step_discovery::{ViableStep, ViableStepDiscovery};
