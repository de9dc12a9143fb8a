//! Audited state machines for tasks and workflow steps.
//!
//! Every state change in the system is an append to a transition log plus an
//! atomic `most_recent` flip; these machines are the only write path. The
//! same-state no-op ("safe transition") is a deliberate policy, not a
//! convenience: it absorbs the races that at-least-once delivery and
//! concurrent workers produce.

pub mod events;
pub mod states;
pub mod step_state_machine;
pub mod task_state_machine;

pub use events::{StepEvent, TaskEvent};
pub use states::{TaskState, WorkflowStepState};
pub use step_state_machine::StepStateMachine;
pub use task_state_machine::TaskStateMachine;
