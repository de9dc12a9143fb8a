//! Compact per-task readiness summary computed from readiness rows; a
//! convenience roll-up for tests and operator tooling.

use serde::{Deserialize, Serialize};

use super::step_readiness::StepReadinessStatus;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskReadinessSummary {
    pub task_id: i64,
    pub total_steps: usize,
    pub ready_steps: usize,
    pub complete_steps: usize,
    pub failed_steps: usize,
    pub permanently_blocked_steps: usize,
}

impl TaskReadinessSummary {
    pub fn from_readiness(task_id: i64, rows: &[StepReadinessStatus]) -> Self {
        Self {
            task_id,
            total_steps: rows.len(),
            ready_steps: rows.iter().filter(|r| r.ready_for_execution).count(),
            complete_steps: rows.iter().filter(|r| r.is_complete()).count(),
            failed_steps: rows.iter().filter(|r| r.is_failed()).count(),
            permanently_blocked_steps: rows
                .iter()
                .filter(|r| r.is_permanently_blocked())
                .count(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_steps > 0 && self.complete_steps == self.total_steps
    }

    pub fn has_failures(&self) -> bool {
        self.failed_steps > 0
    }
}
