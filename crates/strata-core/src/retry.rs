//! Bounded exponential backoff for transient backend failures.
//!
//! Only connection failures ([`crate::error::Error::is_retryable`]) are
//! retried. Logical errors such as `ConstraintViolation` or `NotFound`, and
//! `LockTimeout`, surface on the first attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient backend failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_connection_failures_until_success() {
        let calls = &AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::default(), "ping", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::ConnectionFailure("refused".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let err = with_retry(&RetryPolicy::default(), "ping", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::ConnectionFailure("refused".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ConnectionFailure(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_logical_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let err = with_retry(&RetryPolicy::default(), "insert", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::ConstraintViolation("duplicate".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lock_timeouts_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let err = with_retry(&RetryPolicy::default(), "lock", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::LockTimeout {
                agent_id: "a1".into(),
                timeout_ms: 5,
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
