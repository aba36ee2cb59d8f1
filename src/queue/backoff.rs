//! Exponential backoff for queue calls.
//!
//! Only transient errors are retried. Everything else, claim loss included,
//! is returned to the caller on the first failure.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use super::client::QueueError;

/// Retry settings for claim, reclaim and resolve calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before attempt `attempt` (0-based): 0, d, 2d, 4d, ... capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `call` until it succeeds, fails permanently or attempts run out.
    pub async fn retry<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        self.retry_before(operation, None, call).await
    }

    /// Like [`retry`](Self::retry), but never sleeps past `deadline`.
    pub async fn retry_before<T, F, Fut>(
        &self,
        operation: &str,
        deadline: Option<Instant>,
        mut call: F,
    ) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.delay_for(attempt);
                if let Some(deadline) = deadline {
                    if Instant::now() + delay >= deadline {
                        break;
                    }
                }
                tokio::time::sleep(delay).await;
                tracing::debug!(operation, attempt = attempt + 1, "Retrying queue call");
            }

            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %err,
                        "Transient queue error, will retry"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            QueueError::Transient(format!("{operation}: retry deadline reached"))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_progression() {
        let policy = RetryPolicy::new(6)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(4);
        let result = policy
            .retry("claim", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(QueueError::Transient("connection reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_does_not_retry_claim_lost() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::new(4)
            .retry("reclaim", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(QueueError::ClaimLost("409".into()))
            })
            .await;
        assert!(result.unwrap_err().is_claim_lost());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::new(3)
            .retry("resolve", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(QueueError::RateLimited("slow down".into()))
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retrying() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(10).with_initial_delay(Duration::from_secs(10));
        let deadline = Instant::now() + Duration::from_secs(15);
        let result: Result<(), _> = policy
            .retry_before("reclaim", Some(deadline), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(QueueError::Transient("down".into()))
            })
            .await;
        assert!(result.is_err());
        // 0s and 10s fit before the deadline, 30s does not.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
