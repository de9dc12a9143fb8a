//! Row type returned by the SQL readiness functions. One row per step with
//! the full readiness picture; `ready_for_execution` is the authoritative
//! answer the coordinator acts on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StepReadinessStatus {
    pub workflow_step_id: i64,
    pub task_id: i64,
    pub named_step_id: i64,
    pub name: String,
    pub current_state: String,
    pub dependencies_satisfied: bool,
    pub retry_eligible: bool,
    pub ready_for_execution: bool,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub total_parents: i32,
    pub completed_parents: i32,
    pub attempts: i32,
    pub retry_limit: i32,
    pub backoff_request_seconds: Option<i32>,
    pub last_attempted_at: Option<DateTime<Utc>>,
}

impl StepReadinessStatus {
    /// Failed with the retry budget exhausted; distinct from failed-but-
    /// retrying (a step in backoff is not blocked).
    pub fn is_permanently_blocked(&self) -> bool {
        self.current_state == "error" && self.attempts >= self.retry_limit
    }

    pub fn is_failed(&self) -> bool {
        self.current_state == "error"
    }

    pub fn is_complete(&self) -> bool {
        self.current_state == "complete" || self.current_state == "resolved_manually"
    }
}
