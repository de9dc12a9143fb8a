//! Task and step lifecycle states.
//!
//! States are persisted as snake_case text in the transition tables; the
//! enums here are the in-process view. A missing transition row reads as
//! `Pending` (entities are created pending).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::StateMachineError;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Complete,
    Error,
    Cancelled,
    ResolvedManually,
}

impl TaskState {
    /// Terminal states admit no further transitions (terminal monotonicity).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Complete | TaskState::Cancelled | TaskState::ResolvedManually
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::InProgress => "in_progress",
            TaskState::Complete => "complete",
            TaskState::Error => "error",
            TaskState::Cancelled => "cancelled",
            TaskState::ResolvedManually => "resolved_manually",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = StateMachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "in_progress" => Ok(TaskState::InProgress),
            "complete" => Ok(TaskState::Complete),
            "error" => Ok(TaskState::Error),
            "cancelled" => Ok(TaskState::Cancelled),
            "resolved_manually" => Ok(TaskState::ResolvedManually),
            other => Err(StateMachineError::UnknownState {
                entity: "task",
                state: other.to_string(),
            }),
        }
    }
}

/// Workflow step lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStepState {
    Pending,
    InProgress,
    Complete,
    Error,
    ResolvedManually,
}

impl WorkflowStepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStepState::Complete | WorkflowStepState::ResolvedManually
        )
    }

    /// States that count as terminally successful for dependency
    /// satisfaction.
    pub fn satisfies_dependencies(&self) -> bool {
        self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStepState::Pending => "pending",
            WorkflowStepState::InProgress => "in_progress",
            WorkflowStepState::Complete => "complete",
            WorkflowStepState::Error => "error",
            WorkflowStepState::ResolvedManually => "resolved_manually",
        }
    }
}

impl fmt::Display for WorkflowStepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStepState {
    type Err = StateMachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStepState::Pending),
            "in_progress" => Ok(WorkflowStepState::InProgress),
            "complete" => Ok(WorkflowStepState::Complete),
            "error" => Ok(WorkflowStepState::Error),
            "resolved_manually" => Ok(WorkflowStepState::ResolvedManually),
            other => Err(StateMachineError::UnknownState {
                entity: "workflow_step",
                state: other.to_string(),
            }),
        }
    }
}
