//! Retry discipline for provider requests.
//!
//! Transient failures are retried with capped exponential backoff and
//! jitter, preferring provider-supplied `retry_after` hints. The loop
//! never sleeps past the caller's deadline, and fatal errors surface on
//! the first attempt.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use super::ProviderError;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_BACKOFF_MS: u64 = 1000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 60_000;
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Jitter applied to computed backoffs, as a fraction of the delay.
const JITTER_FRACTION: f64 = 0.1;

/// Policy for retrying failed provider requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempt cap, including the first attempt.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_backoff: Duration,
        max_backoff: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            base_backoff,
            max_backoff,
            multiplier,
        }
    }

    /// Backoff before the (retry_index + 1)-th retry: base * multiplier^i,
    /// capped at the configured maximum. Deterministic; jitter is applied
    /// separately.
    pub fn backoff(&self, retry_index: u32) -> Duration {
        let ms = (self.base_backoff.as_millis() as f64
            * self.multiplier.powi(retry_index as i32))
        .min(self.max_backoff.as_millis() as f64) as u64;
        Duration::from_millis(ms)
    }

    fn jittered_backoff(&self, retry_index: u32) -> Duration {
        let base = self.backoff(retry_index);
        let factor = rand::rng().random_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        let ms = (base.as_millis() as f64 * factor) as u64;
        Duration::from_millis(ms).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

/// Why the retry loop gave up.
#[derive(Debug)]
pub enum RetryErrorKind {
    /// Non-retryable error; surfaced from the first failing attempt.
    Fatal(ProviderError),
    /// Transient error still present after the attempt cap.
    Exhausted(ProviderError),
    /// The caller's deadline expired before another attempt could run.
    DeadlineExceeded,
}

/// Terminal result of a failed retry loop, with the number of attempts
/// actually made.
#[derive(Debug)]
pub struct RetryError {
    pub attempts: u32,
    pub kind: RetryErrorKind,
}

/// Run `operation` until it succeeds, the attempt cap is reached, a fatal
/// error occurs, or the deadline expires. On success returns the attempt
/// count alongside the value.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Instant,
    mut operation: F,
) -> Result<(u32, T), RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempts = 0u32;

    loop {
        if Instant::now() >= deadline {
            return Err(RetryError {
                attempts,
                kind: RetryErrorKind::DeadlineExceeded,
            });
        }

        attempts += 1;
        // Bound the attempt by the remaining deadline budget; an expired
        // timer here also aborts the in-flight provider call.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = match tokio::time::timeout(remaining, operation()).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                return Err(RetryError {
                    attempts,
                    kind: RetryErrorKind::DeadlineExceeded,
                });
            }
        };
        match outcome {
            Ok(value) => {
                if attempts > 1 {
                    debug!(attempts, "Provider request succeeded after retry");
                }
                return Ok((attempts, value));
            }
            Err(error) if !error.is_transient() => {
                return Err(RetryError {
                    attempts,
                    kind: RetryErrorKind::Fatal(error),
                });
            }
            Err(error) if attempts >= policy.max_attempts => {
                warn!(
                    attempts,
                    max_attempts = policy.max_attempts,
                    error = %error,
                    "Retry attempts exhausted"
                );
                return Err(RetryError {
                    attempts,
                    kind: RetryErrorKind::Exhausted(error),
                });
            }
            Err(error) => {
                // Prefer the provider-supplied wait over the computed backoff.
                let backoff = error
                    .retry_after()
                    .unwrap_or_else(|| policy.jittered_backoff(attempts - 1));

                if Instant::now() + backoff >= deadline {
                    return Err(RetryError {
                        attempts,
                        kind: RetryErrorKind::DeadlineExceeded,
                    });
                }

                warn!(
                    attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Provider request failed, retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(10),
            2.0,
        )
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_backoff, Duration::from_millis(1000));
        assert_eq!(policy.max_backoff, Duration::from_millis(60_000));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(5),
            2.0,
        );
        assert_eq!(policy.backoff(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.jittered_backoff(0).as_millis() as f64;
            assert!((900.0..=1100.0).contains(&d), "jittered backoff {d}ms");
        }
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = run_with_retry(&fast_policy(3), far_deadline(), || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderError::Api {
                        status: 503,
                        message: "overloaded".into(),
                    })
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        let (attempts, value) = result.unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_never_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(u32, ()), _> = run_with_retry(&fast_policy(5), far_deadline(), || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Authentication("invalid key".into()))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.kind, RetryErrorKind::Fatal(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_after_attempt_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(u32, ()), _> = run_with_retry(&fast_policy(3), far_deadline(), || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Api {
                    status: 500,
                    message: "boom".into(),
                })
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(matches!(err.kind, RetryErrorKind::Exhausted(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_after_hint_preferred() {
        // A long default backoff with a tiny retry_after hint must finish
        // quickly, proving the hint took precedence.
        let policy = RetryPolicy::new(
            2,
            Duration::from_secs(60),
            Duration::from_secs(60),
            2.0,
        );
        let start = Instant::now();

        let result: Result<(u32, ()), _> = run_with_retry(&policy, far_deadline(), || async {
            Err(ProviderError::RateLimited {
                retry_after: Some(Duration::from_millis(1)),
            })
        })
        .await;

        assert!(matches!(
            result.unwrap_err().kind,
            RetryErrorKind::Exhausted(_)
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_deadline_cuts_retries_short() {
        // Backoff (1s) would overshoot the 50ms deadline, so the loop stops
        // after the first attempt instead of sleeping.
        let policy = RetryPolicy::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(1),
            2.0,
        );
        let deadline = Instant::now() + Duration::from_millis(50);

        let result: Result<(u32, ()), _> = run_with_retry(&policy, deadline, || async {
            Err(ProviderError::Api {
                status: 500,
                message: "boom".into(),
            })
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.kind, RetryErrorKind::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_slow_attempt_is_cut_off_at_deadline() {
        // The operation never resolves on its own; the deadline must abort
        // the in-flight attempt.
        let deadline = Instant::now() + Duration::from_millis(50);

        let result: Result<(u32, ()), _> = run_with_retry(&fast_policy(3), deadline, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.kind, RetryErrorKind::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_expired_deadline_means_zero_attempts() {
        let deadline = Instant::now() - Duration::from_millis(1);

        let result: Result<(u32, ()), _> =
            run_with_retry(&fast_policy(3), deadline, || async { Ok(()) }).await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 0);
        assert!(matches!(err.kind, RetryErrorKind::DeadlineExceeded));
    }
}
