//! Retry scheduling: compute when a failed step becomes eligible again and
//! publish the corresponding wake-up.
//!
//! Pure function of step state — the calculator holds no memory, and
//! rescheduling is idempotent: the readiness engine recomputes eligibility
//! from the same inputs on every query, so a missed or duplicate wake-up
//! only affects timing, never correctness.
//!
//! An explicit `backoff_request_seconds` hint is deterministic and takes
//! precedence. The exponential path applies full jitter
//! (`uniform(0, min(2^attempts, 30))`) so a herd of failed steps does not
//! wake in lockstep; SQL-side *eligibility* stays deterministic at the full
//! window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use conveyor_shared::errors::{OrchestrationError, OrchestrationResult};
use conveyor_shared::messaging::EnqueueReason;
use conveyor_shared::models::orchestration::StepReadinessStatus;
use conveyor_shared::system_context::SystemContext;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    context: Arc<SystemContext>,
}

impl BackoffCalculator {
    pub fn new(context: Arc<SystemContext>) -> Self {
        Self { context }
    }

    fn max_backoff_seconds(&self) -> u32 {
        self.context.config().backoff.max_backoff_seconds
    }

    /// Absolute timestamp at which a failed step becomes eligible again;
    /// `None` when there is nothing to wait for (never failed, or the hint
    /// lacks its anchor).
    pub fn next_retry_at(
        &self,
        attempts: i32,
        backoff_request_seconds: Option<i32>,
        last_attempted_at: Option<DateTime<Utc>>,
        last_failure_at: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        if let (Some(hint), Some(attempted_at)) = (backoff_request_seconds, last_attempted_at) {
            return Some(attempted_at + Duration::seconds(i64::from(hint)));
        }

        let failed_at = last_failure_at?;
        let base = self.base_seconds(attempts);
        let wait = if self.context.config().backoff.jitter {
            fastrand::f64() * base
        } else {
            base
        };
        Some(failed_at + Duration::milliseconds((wait * 1000.0) as i64))
    }

    /// `min(2^attempts, cap)` in seconds.
    fn base_seconds(&self, attempts: i32) -> f64 {
        2f64.powi(attempts.clamp(0, 31))
            .min(f64::from(self.max_backoff_seconds()))
    }

    /// Convenience over a readiness row.
    pub fn next_retry_for(&self, row: &StepReadinessStatus) -> Option<DateTime<Utc>> {
        self.next_retry_at(
            row.attempts,
            row.backoff_request_seconds,
            row.last_attempted_at,
            row.last_failure_at,
        )
    }

    /// Earliest deterministic retry window across a task's failed steps, as
    /// reported by the readiness engine. The finalizer uses this to delay the
    /// re-enqueue to the nearest wake-up.
    pub fn nearest_retry_at(&self, rows: &[StepReadinessStatus]) -> Option<DateTime<Utc>> {
        rows.iter()
            .filter(|r| r.is_failed() && !r.is_permanently_blocked())
            .filter_map(|r| r.next_retry_at)
            .min()
    }

    /// Publish a "retry this task at time T" wake-up for a failed step.
    pub async fn schedule_retry(
        &self,
        task_id: i64,
        row: &StepReadinessStatus,
        correlation_id: Option<Uuid>,
    ) -> OrchestrationResult<()> {
        let not_before = self.next_retry_for(row);
        self.context
            .message_client()
            .enqueue_task(task_id, EnqueueReason::Retry, not_before, correlation_id)
            .await
            .map_err(|e| OrchestrationError::MessagingError(e.to_string()))?;

        debug!(
            task_id,
            workflow_step_id = row.workflow_step_id,
            next_retry_at = ?not_before,
            "Scheduled retry wake-up"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_shared::config::ConveyorConfig;
    use sqlx::PgPool;

    async fn calculator(pool: PgPool, jitter: bool) -> BackoffCalculator {
        let mut config = ConveyorConfig::default();
        config.backoff.jitter = jitter;
        let context = SystemContext::with_pool_and_config(pool, config)
            .await
            .unwrap();
        BackoffCalculator::new(Arc::new(context))
    }

    #[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
    async fn explicit_hint_takes_precedence(pool: PgPool) {
        let calc = calculator(pool, true).await;
        let attempted = Utc::now();
        let failed = attempted - Duration::seconds(10);

        let next = calc
            .next_retry_at(1, Some(60), Some(attempted), Some(failed))
            .unwrap();
        assert_eq!(next, attempted + Duration::seconds(60));
    }

    #[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
    async fn exponential_window_is_jittered_and_bounded(pool: PgPool) {
        let calc = calculator(pool, true).await;
        let failed = Utc::now();

        for _ in 0..32 {
            let next = calc.next_retry_at(3, None, None, Some(failed)).unwrap();
            let wait = next - failed;
            // full jitter over [0, 2^3]
            assert!(wait >= Duration::zero());
            assert!(wait <= Duration::seconds(8));
        }
    }

    #[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
    async fn window_caps_at_thirty_seconds(pool: PgPool) {
        let calc = calculator(pool, true).await;
        let failed = Utc::now();

        for attempts in [5, 10, 30, 1000] {
            let next = calc
                .next_retry_at(attempts, None, None, Some(failed))
                .unwrap();
            assert!(next - failed <= Duration::seconds(30));
        }
    }

    #[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
    async fn deterministic_window_without_jitter(pool: PgPool) {
        let calc = calculator(pool, false).await;
        let failed = Utc::now();

        let next = calc.next_retry_at(1, None, None, Some(failed)).unwrap();
        assert_eq!(next - failed, Duration::seconds(2));

        let next = calc.next_retry_at(10, None, None, Some(failed)).unwrap();
        assert_eq!(next - failed, Duration::seconds(30));
    }

    #[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
    async fn schedule_retry_publishes_a_delayed_wakeup(pool: PgPool) {
        use conveyor_shared::models::orchestration::StepReadinessStatus;

        let calc = calculator(pool, false).await;
        calc.context
            .message_client()
            .ensure_task_queue()
            .await
            .unwrap();

        let row = StepReadinessStatus {
            workflow_step_id: 11,
            task_id: 42,
            named_step_id: 1,
            name: "flaky".to_string(),
            current_state: "error".to_string(),
            dependencies_satisfied: true,
            retry_eligible: false,
            ready_for_execution: false,
            last_failure_at: Some(Utc::now() + Duration::seconds(30)),
            next_retry_at: None,
            total_parents: 0,
            completed_parents: 0,
            attempts: 1,
            retry_limit: 3,
            backoff_request_seconds: None,
            last_attempted_at: None,
        };
        calc.schedule_retry(42, &row, None).await.unwrap();

        // The wake-up is delayed past the retry window, so it is enqueued
        // but not yet visible.
        assert!(calc
            .context
            .message_client()
            .receive_task_messages()
            .await
            .unwrap()
            .is_empty());
    }

    #[sqlx::test(migrator = "conveyor_shared::database::migrator::MIGRATOR")]
    async fn no_failure_means_no_window(pool: PgPool) {
        let calc = calculator(pool, true).await;
        assert!(calc.next_retry_at(0, None, None, None).is_none());
        // A hint without its anchor falls back to the failure timestamp.
        assert!(calc.next_retry_at(1, Some(30), None, None).is_none());
    }
}
