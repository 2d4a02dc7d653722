//! Bounded retry with exponential backoff for transient store failures.
//!
//! Only `StoreError::Transient` is retried; every other variant carries
//! semantic meaning (lost CAS race, protocol error) and must surface to
//! the caller unchanged.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::{StoreError, StoreResult};

/// Backoff schedule for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on the per-retry delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

/// Run `op`, retrying transient failures per `policy`.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient store failure, retrying"
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
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retries(&quick(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Transient("throttled".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = with_retries(&quick(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Transient("still down".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn semantic_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: StoreResult<()> = with_retries(&quick(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::PreconditionFailed("lost race".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::PreconditionFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = quick();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4));
        assert_eq!(policy.delay_for(10), Duration::from_millis(4));
    }
}
