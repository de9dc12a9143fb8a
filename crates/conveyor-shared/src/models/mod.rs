//! Persistent models and the orchestration-facing row types.

pub mod core;
pub mod orchestration;

#[cfg(any(test, feature = "test-utils"))]
pub mod factories;

pub use core::task::{NewTask, Task};
pub use core::task_transition::{NewTaskTransition, TaskTransition};
pub use core::workflow_step::{NewWorkflowStep, WorkflowStep};
pub use core::workflow_step_edge::WorkflowStepEdge;
pub use core::workflow_step_transition::{NewWorkflowStepTransition, WorkflowStepTransition};
