//! Exponential backoff retries.
//!
//! The retrier holds no shared state. Each call to [`retry`] attempts the
//! operation up to `max_retries + 1` times and sleeps between attempts:
//!
//! ```text
//! delay(k) = min(base_delay * multiplier^(k-1), max_delay)    k = 1..=max_retries
//! ```
//!
//! With jitter enabled the delay is moved by up to ±10%. Both the sleep and
//! each attempt are raced against the caller's [`CancellationToken`].
//!
//! # Example
//!
//! ```rust,ignore
//! use dependency_guard::resilience::{BackoffConfig, retry};
//! use tokio_util::sync::CancellationToken;
//!
//! let cancel = CancellationToken::new();
//! let config = BackoffConfig::default();
//! let hits = retry(&cancel, &config, || client.search(&query)).await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::{BoxError, GuardError, is_cancellation};
use crate::error::classify_text;

/// Maximum jitter as a fraction of the delay.
const JITTER_FACTOR: f64 = 0.1;

/// Decides whether a failed attempt may be retried.
pub type RetryPredicate = Arc<dyn Fn(&BoxError) -> bool + Send + Sync>;

/// Backoff configuration for one call site.
#[derive(Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor applied per retry.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Move each delay by up to ±10%.
    pub jitter: bool,
    /// Retry predicate.
    pub retry_if: RetryPredicate,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_retries: 3,
            jitter: true,
            retry_if: Arc::new(retry_unless_cancelled),
        }
    }
}

impl fmt::Debug for BackoffConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffConfig")
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .field("max_retries", &self.max_retries)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl BackoffConfig {
    /// Create a configuration with the default retry predicate.
    #[must_use]
    pub fn new(
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        max_retries: u32,
        jitter: bool,
    ) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            max_retries,
            jitter,
            ..Self::default()
        }
    }

    /// Replace the retry predicate.
    #[must_use]
    pub fn with_retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&BoxError) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Arc::new(predicate);
        self
    }

    /// Total attempts this configuration allows.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry `k` (1-based), without jitter.
    #[must_use]
    pub fn delay_for_retry(&self, k: u32) -> Duration {
        if k == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(k - 1).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let nanos = self.base_delay.as_nanos() as f64 * factor;
        let max_nanos = self.max_delay.as_nanos() as f64;

        if !nanos.is_finite() || nanos >= max_nanos {
            return self.max_delay;
        }
        if nanos >= u64::MAX as f64 {
            return Duration::try_from_secs_f64(nanos / 1e9).unwrap_or(self.max_delay);
        }
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }

    /// Delay before retry `k`, with jitter applied when enabled.
    fn wait_before_retry(&self, k: u32) -> Duration {
        let delay = self.delay_for_retry(k);
        if self.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }
}

/// Default predicate: everything is retryable except cancellation and deadlines.
fn retry_unless_cancelled(error: &BoxError) -> bool {
    !is_cancellation(&**error)
}

/// Predicate that retries only transient failures.
///
/// Uses the same text rules as [`crate::error::classify`], so a `400 Bad
/// Request` or `401 Unauthorized` stops immediately while timeouts, refused
/// connections and rate limits are retried.
#[must_use]
pub fn retry_service_errors(error: &BoxError) -> bool {
    if is_cancellation(&**error) {
        return false;
    }
    if let Some(service_error) = error.downcast_ref::<crate::error::ServiceError>() {
        return service_error.code().is_retryable();
    }
    classify_text(&error.to_string()).is_retryable()
}

/// Move a delay by up to ±10% using a thread-local RNG.
fn apply_jitter(delay: Duration) -> Duration {
    let offset: f64 = rand::rng().random_range(-JITTER_FACTOR..=JITTER_FACTOR);
    let secs = delay.as_secs_f64() * (1.0 + offset).max(0.0);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Run `operation` with exponential backoff.
///
/// Returns the first success, the first non-retryable error unchanged,
/// [`GuardError::Cancelled`] if `cancel` fires at any point, or
/// [`GuardError::RetriesExhausted`] wrapping the last failure.
pub async fn retry<T, E, F, Fut>(
    cancel: &CancellationToken,
    config: &BackoffConfig,
    mut operation: F,
) -> Result<T, BoxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    let max_attempts = config.max_attempts();
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(GuardError::Cancelled.into());
        }

        attempt += 1;
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GuardError::Cancelled.into()),
            result = operation() => result,
        };

        let error: BoxError = match result {
            Ok(value) => return Ok(value),
            Err(e) => e.into(),
        };

        if !(config.retry_if)(&error) {
            tracing::debug!(attempt, error = %error, "Error is not retryable");
            return Err(error);
        }

        if attempt >= max_attempts {
            tracing::warn!(attempts = attempt, error = %error, "Retries exhausted");
            return Err(GuardError::RetriesExhausted {
                attempts: attempt,
                source: error,
            }
            .into());
        }

        let delay = config.wait_before_retry(attempt);
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, backing off"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GuardError::Cancelled.into()),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct Flaky(&'static str);

    fn no_jitter(base_ms: u64, multiplier: f64, max_ms: u64, max_retries: u32) -> BackoffConfig {
        BackoffConfig::new(
            Duration::from_millis(base_ms),
            multiplier,
            Duration::from_millis(max_ms),
            max_retries,
            false,
        )
    }

    #[test]
    fn test_default_config() {
        let config = BackoffConfig::default();
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_attempts(), 4);
        assert!(config.jitter);
    }

    #[test]
    fn test_delay_sequence_is_exact_without_jitter() {
        let config = no_jitter(50, 2.0, 10_000, 5);
        assert_eq!(config.delay_for_retry(1), Duration::from_millis(50));
        assert_eq!(config.delay_for_retry(2), Duration::from_millis(100));
        assert_eq!(config.delay_for_retry(3), Duration::from_millis(200));
        assert_eq!(config.delay_for_retry(4), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = no_jitter(100, 3.0, 500, 10);
        assert_eq!(config.delay_for_retry(2), Duration::from_millis(300));
        assert_eq!(config.delay_for_retry(3), Duration::from_millis(500));
        assert_eq!(config.delay_for_retry(60), Duration::from_millis(500));
    }

    #[test]
    fn test_huge_exponent_does_not_overflow() {
        let config = no_jitter(100, 10.0, 2_000, u32::MAX);
        assert_eq!(config.delay_for_retry(u32::MAX), Duration::from_millis(2_000));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        for _ in 0..200 {
            let jittered = apply_jitter(Duration::from_millis(1_000));
            assert!(jittered >= Duration::from_millis(900), "{jittered:?}");
            assert!(jittered <= Duration::from_millis(1_100), "{jittered:?}");
        }
    }

    #[test]
    fn test_uncapped_delays_saturate_instead_of_panicking() {
        let config = BackoffConfig::new(Duration::MAX, 1.0, Duration::MAX, 1, true);
        for _ in 0..50 {
            assert!(config.wait_before_retry(1) >= Duration::from_secs(u64::MAX / 2));
        }

        let long = no_jitter(1_000_000_000_000, 10.0, u64::MAX, 3);
        assert_eq!(long.delay_for_retry(3), Duration::from_secs(100_000_000_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_uncapped_delay_stops_on_cancel() {
        let config = BackoffConfig::new(Duration::MAX, 1.0, Duration::MAX, 1, true);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let error = retry(&cancel, &config, || async {
            Err::<(), _>(Flaky("connection refused"))
        })
        .await
        .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<GuardError>(),
            Some(GuardError::Cancelled)
        ));
    }

    #[test]
    fn test_retry_service_errors_predicate() {
        let transient: BoxError = Box::new(Flaky("connection refused"));
        let permanent: BoxError = Box::new(Flaky("400 Bad Request"));
        let cancelled: BoxError = GuardError::Cancelled.into();

        assert!(retry_service_errors(&transient));
        assert!(!retry_service_errors(&permanent));
        assert!(!retry_service_errors(&cancelled));
    }

    #[tokio::test]
    async fn test_success_short_circuits() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let config = no_jitter(1, 2.0, 10, 3);

        let result = retry(&cancel, &config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Flaky>(7)
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let config = no_jitter(10, 2.0, 1_000, 3);

        let result = retry(&cancel, &config, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Flaky("connection reset"))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_yields_one_attempt() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let config = no_jitter(1, 2.0, 10, 5).with_retry_if(|_| false);

        let error = retry(&cancel, &config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Flaky("invalid payload"))
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(error.to_string(), "invalid payload");
    }

    #[tokio::test]
    async fn test_cancellation_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let config = no_jitter(1, 2.0, 10, 5);

        let error = retry(&cancel, &config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(GuardError::Cancelled)
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(is_cancellation(&*error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let config = no_jitter(5, 2.0, 100, 2);

        let error = retry(&cancel, &config, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Flaky(if n == 2 { "last failure" } else { "earlier failure" }))
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match error.downcast_ref::<GuardError>() {
            Some(GuardError::RetriesExhausted { attempts, source }) => {
                assert_eq!(*attempts, 3);
                assert_eq!(source.to_string(), "last failure");
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert!(error.to_string().contains("3 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait_returns_immediately() {
        let cancel = CancellationToken::new();
        let config = no_jitter(10_000, 2.0, 60_000, 3);
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let error = retry(&cancel, &config, || async {
            Err::<(), _>(Flaky("connection refused"))
        })
        .await
        .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(
            error.downcast_ref::<GuardError>(),
            Some(GuardError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_already_cancelled_never_calls_operation() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = retry(&cancel, &BackoffConfig::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Flaky>(())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
