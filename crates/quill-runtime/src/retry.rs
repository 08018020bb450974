// ABOUTME: Exponential backoff for transient storage failures.
// ABOUTME: Used in-line for caller operations and across flush cycles for dirty entries.

use std::future::Future;
use std::time::Duration;

use quill_core::StorageError;

/// Retry limits for transient failures (`StorageError::is_retryable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the `attempt`-th failure: `base * 2^(attempt - 1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay before the next try after `failures` consecutive failures, or
    /// `None` once the attempts are used up.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        (failures < self.max_attempts).then(|| self.delay_for(failures))
    }

    /// Run `operation`, retrying retryable errors with backoff.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let Some(delay) = err.is_retryable().then(|| self.next_delay(attempt)).flatten()
                    else {
                        return Err(err);
                    };
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "{what} failed, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(3),
        }
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(60), Duration::from_secs(1));
    }

    #[test]
    fn next_delay_stops_at_max_attempts() {
        let policy = policy();
        assert!(policy.next_delay(1).is_some());
        assert!(policy.next_delay(2).is_some());
        assert!(policy.next_delay(3).is_none());
    }

    #[tokio::test]
    async fn run_retries_transient_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = policy()
            .run("write", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::Database("locked".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy()
            .run("write", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::BackendUnavailable("down".into()))
            })
            .await;
        assert!(matches!(result, Err(StorageError::BackendUnavailable(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_does_not_retry_terminal_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy()
            .run("read", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::malformed("players", "p1", "bad"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
