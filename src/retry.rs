//! Backoff-retry executor wrapping every external call.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from model and storage services are transient and
//! frequent on shared CI runners. The wait before retry `n` (1-based) is
//! `min(base * 2^(n-1) * (1 + jitter), max_backoff)` with `jitter` drawn from
//! `[0, 0.25)`. Because the doubling always outgrows the jitter the delays are
//! non-decreasing, and the cap bounds every single wait.
//!
//! The loop is explicit: each attempt returns a `Result`, the caller-supplied
//! classifier decides between waiting and giving up, and the final outcome is
//! `Ok(value)` or a [`RetryFailure`] carrying the attempt count.

use crate::config::JobConfig;
use crate::error::{ErrorClass, UnitError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

/// Upper bound of the random fraction added to each backoff.
const MAX_JITTER: f64 = 0.25;

/// Retry bounds for one class of external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub num_retries: u32,
    /// Delay before the first retry, before jitter.
    pub base: Duration,
    /// Cap applied to every individual delay.
    pub max_backoff: Duration,
    /// Per-attempt timeout; expiry counts as a retryable failure.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &JobConfig) -> Self {
        Self {
            num_retries: config.num_retries,
            base: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_secs(config.max_backoff_seconds),
            call_timeout: config.api_timeout(),
        }
    }

    /// Delay before retry number `retry` (1-based), given a jitter fraction.
    ///
    /// `jitter` is clamped to `[0, MAX_JITTER)` so callers cannot break the
    /// monotonic guarantee.
    pub fn backoff_delay(&self, retry: u32, jitter: f64) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let raw = self.base.saturating_mul(1u32 << exp).min(self.max_backoff);
        let jitter = jitter.clamp(0.0, MAX_JITTER - f64::EPSILON);
        raw.mul_f64(1.0 + jitter).min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails fatally, or the retry bound is spent.
    ///
    /// `op` receives the 0-based attempt number. `classify` decides whether a
    /// failed attempt is worth repeating; most callers pass [`UnitError::class`].
    /// Every attempt is logged with its number and latency.
    pub async fn execute<T, F, Fut, C>(
        &self,
        label: &str,
        mut op: F,
        classify: C,
    ) -> Result<Retried<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UnitError>>,
        C: Fn(&UnitError) -> ErrorClass,
    {
        let max_attempts = self.num_retries.saturating_add(1);
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            let outcome = match timeout(self.call_timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(UnitError::Timeout(self.call_timeout.as_secs())),
            };
            let latency_ms = started.elapsed().as_millis() as u64;
            let attempts = attempt + 1;

            let error = match outcome {
                Ok(value) => {
                    debug!(label, attempt = attempts, latency_ms, "call succeeded");
                    return Ok(Retried { value, attempts });
                }
                Err(e) => e,
            };

            match classify(&error) {
                ErrorClass::Fatal => {
                    warn!(label, attempt = attempts, latency_ms, error = %error, "fatal error, not retrying");
                    return Err(RetryFailure::Fatal { error, attempts });
                }
                ErrorClass::Retryable if attempts >= max_attempts => {
                    warn!(label, attempt = attempts, latency_ms, error = %error, "retries exhausted");
                    return Err(RetryFailure::Exhausted { error, attempts });
                }
                ErrorClass::Retryable => {
                    let jitter = rand::thread_rng().gen_range(0.0..MAX_JITTER);
                    let delay = self.backoff_delay(attempts, jitter);
                    warn!(
                        label,
                        attempt = attempts,
                        latency_ms,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "attempt failed, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// A successful result plus the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Why the executor gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryFailure {
    /// The classifier marked the error fatal.
    Fatal { error: UnitError, attempts: u32 },
    /// Every allowed attempt failed with a retryable error.
    Exhausted { error: UnitError, attempts: u32 },
}

impl RetryFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Fatal { attempts, .. } | RetryFailure::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn error(&self) -> &UnitError {
        match self {
            RetryFailure::Fatal { error, .. } | RetryFailure::Exhausted { error, .. } => error,
        }
    }

    pub fn into_error(self) -> UnitError {
        match self {
            RetryFailure::Fatal { error, .. } | RetryFailure::Exhausted { error, .. } => error,
        }
    }
}

impl std::fmt::Display for RetryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryFailure::Fatal { error, attempts } => {
                write!(f, "{error} (fatal, after {attempts} attempt(s))")
            }
            RetryFailure::Exhausted { error, attempts } => {
                write!(f, "{error} (gave up after {attempts} attempt(s))")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(num_retries: u32) -> RetryPolicy {
        RetryPolicy {
            num_retries,
            base: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let p = policy(10);
        assert_eq!(p.backoff_delay(1, 0.0), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(2, 0.0), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(4, 0.0), Duration::from_millis(800));
        assert_eq!(p.backoff_delay(5, 0.0), Duration::from_secs(1));
        assert_eq!(p.backoff_delay(40, 0.2), Duration::from_secs(1));
    }

    #[test]
    fn delays_are_non_decreasing_for_any_jitter() {
        let p = policy(12);
        let jitters = [0.0, 0.249, 0.1, 0.249, 0.0, 0.2, 0.0, 0.249, 0.05, 0.0, 0.24, 0.0];
        let mut prev = Duration::ZERO;
        for (i, j) in jitters.iter().enumerate() {
            let d = p.backoff_delay(i as u32 + 1, *j);
            assert!(d >= prev, "retry {}: {:?} < {:?}", i + 1, d, prev);
            assert!(d <= p.max_backoff);
            prev = d;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_attempts_retries_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let started = Instant::now();

        let result: Result<Retried<()>, _> = policy(3)
            .execute(
                "test",
                |_| {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(UnitError::Transient("503".into()))
                    }
                },
                UnitError::class,
            )
            .await;

        let failure = result.unwrap_err();
        assert!(matches!(failure, RetryFailure::Exhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 100 + 200 + 400 ms plus at most 25% jitter each.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(700), "{waited:?}");
        assert!(waited < Duration::from_millis(875), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<Retried<()>, _> = policy(5)
            .execute(
                "test",
                |_| {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(UnitError::Fatal("401 unauthorized".into()))
                    }
                },
                UnitError::class,
            )
            .await;
        assert!(matches!(result, Err(RetryFailure::Fatal { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let result = policy(3)
            .execute(
                "test",
                |attempt| async move {
                    if attempt < 2 {
                        Err(UnitError::RateLimited("429".into()))
                    } else {
                        Ok("done")
                    }
                },
                UnitError::class,
            )
            .await
            .unwrap();
        assert_eq!(result.value, "done");
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_and_is_retried() {
        let mut p = policy(1);
        p.call_timeout = Duration::from_secs(2);
        let result = p
            .execute(
                "test",
                |attempt| async move {
                    if attempt == 0 {
                        sleep(Duration::from_secs(60)).await;
                    }
                    Ok::<_, UnitError>(attempt)
                },
                UnitError::class,
            )
            .await
            .unwrap();
        assert_eq!(result.value, 1);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_classifier_overrides_default() {
        let result: Result<Retried<()>, _> = policy(3)
            .execute(
                "test",
                |_| async { Err(UnitError::Validation("empty".into())) },
                |_| ErrorClass::Fatal,
            )
            .await;
        assert_eq!(result.unwrap_err().attempts(), 1);
    }
}
