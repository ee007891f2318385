//! Retry combinator with exponential backoff.
//!
//! Stateless: the policy is plain data and the combinator keeps no shared
//! state, so concurrent independent calls are safe. Failure classification
//! lives on [`SyncError::is_retryable`]; this module only schedules.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{SyncError, SyncResult};

/// Backoff policy for transient remote failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total invocations allowed, the first call included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before re-issuing after the given attempt (1-indexed):
    /// `base * multiplier^(attempt - 1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = self.base_delay_ms as f64 * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(ms as u64)
    }
}

/// Run `op` until it succeeds, fails terminally, or attempts run out.
///
/// Retryable errors are re-issued after the policy's backoff delay;
/// terminal errors and the last attempt's error propagate immediately.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            multiplier: 2.0,
        }
    }

    /// Fails `failures` times with a transient error, then succeeds with
    /// the invocation count.
    fn flaky(
        calls: &Arc<AtomicU32>,
        failures: u32,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = SyncResult<u32>> + Send>> {
        let counter = calls.clone();
        move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                if n <= failures {
                    Err(SyncError::transient("connection reset"))
                } else {
                    Ok(n)
                }
            })
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_n_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry(&quick_policy(3), flaky(&calls, 2)).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_propagates_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry(&quick_policy(3), flaky(&calls, 5)).await;
        assert!(matches!(result, Err(SyncError::Transient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: SyncResult<()> = with_retry(&quick_policy(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::from_status(422, "hubspot", "bad payload")) }
        })
        .await;
        assert!(matches!(result, Err(SyncError::TerminalRemote { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_try_success() {
        let calls = Arc::new(AtomicU32::new(0));
        assert_eq!(with_retry(&quick_policy(1), flaky(&calls, 0)).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }
}
