//! Events accepted by the task and step state machines.
//!
//! An event names *why* a transition happens; the machine maps it to a
//! target state from the current state and refuses combinations outside the
//! allowed-transition table.

use serde_json::Value;

/// Events that drive task transitions
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A worker picked the task up: pending -> in_progress
    Start,
    /// Finalizer determined all steps are terminally successful:
    /// in_progress -> complete
    Complete,
    /// Finalizer determined the task is blocked by permanent failures:
    /// in_progress -> error
    Fail(String),
    /// More work remains; hand the task back to the queue:
    /// in_progress -> pending
    Reenqueue,
    /// Operator-initiated retry: error -> pending
    Retry,
    /// Operator cancelled the task: pending | in_progress | error -> cancelled
    Cancel,
    /// Operator resolved the task by hand: error -> resolved_manually
    ResolveManually,
}

/// Events that drive workflow step transitions
#[derive(Debug, Clone)]
pub enum StepEvent {
    /// Executor claimed the step: pending | error -> in_progress.
    /// Retries execute directly from error; the pending reset is only used
    /// by the explicit retry-scheduling path.
    Start,
    /// Handler returned normally: in_progress -> complete
    Complete(Option<Value>),
    /// Handler raised (or timed out): in_progress -> error
    Fail(String),
    /// Retry scheduled: error -> pending
    Retry,
    /// Operator resolved the step by hand: error -> resolved_manually
    ResolveManually,
}
