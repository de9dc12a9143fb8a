//! Bounded retry for transient database failures.
//!
//! Only operation-level transience is retried here (lost connections,
//! deadlocks, serialization failures). Invariant violations, illegal
//! transitions, and configuration failures propagate immediately — retrying
//! those would mask bugs.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before the given (1-based) retry attempt.
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Classify a sqlx error as transient (retry-worthy) or not.
pub fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            // 40001 serialization_failure, 40P01 deadlock_detected,
            // 57P03 cannot_connect_now
            matches!(
                db.code().as_deref(),
                Some("40001") | Some("40P01") | Some("57P03")
            )
        }
        _ => false,
    }
}

/// Run `operation` with bounded retries on transient database errors. The
/// closure is re-invoked from scratch on every attempt, so it must be
/// idempotent at the database level (every caller here wraps a read or an
/// idempotent write).
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if is_transient(&error) && attempt < policy.max_attempts => {
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %error,
                    "Transient database error; retrying"
                );
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(error) => return Err(error),
        }
    }
}
