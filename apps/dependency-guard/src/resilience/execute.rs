//! Composition of breaker, deadline, and retry for one named operation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{BackoffConfig, BoxError, CircuitBreaker, GuardError, retry};
use crate::observability;

/// How calls to one dependency are guarded.
///
/// Every layer is optional. A policy with nothing set runs the operation once.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// Operation name used in logs, metrics, and timeout errors.
    pub name: String,
    /// Breaker gating the whole call. `None` never rejects.
    pub breaker: Option<Arc<CircuitBreaker>>,
    /// Deadline for the whole call, retries and waits included.
    pub timeout: Option<Duration>,
    /// Retry schedule. `None` makes a single attempt.
    pub backoff: Option<BackoffConfig>,
}

impl ExecutionPolicy {
    /// Create an unguarded policy.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            breaker: None,
            timeout: None,
            backoff: None,
        }
    }

    /// Gate calls with `breaker`.
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Bound the whole call by `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry failed attempts with `backoff`.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// Run `operation` under `policy`.
///
/// The breaker admits or rejects the call as a whole and records one outcome
/// for it. Inside, the deadline bounds every attempt and every backoff wait.
/// Errors are [`GuardError`] values or the operation's own error, boxed.
pub async fn execute<T, E, F, Fut>(
    policy: &ExecutionPolicy,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, BoxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    let bounded = || run_bounded(policy, cancel, operation);
    match &policy.breaker {
        Some(breaker) => breaker.execute(cancel, bounded).await,
        None => bounded().await,
    }
}

async fn run_bounded<T, E, F, Fut>(
    policy: &ExecutionPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, BoxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    if cancel.is_cancelled() {
        return Err(GuardError::Cancelled.into());
    }

    let mut attempt: u32 = 0;
    let mut counted = || {
        attempt += 1;
        if attempt > 1 {
            observability::record_retry_attempt(&policy.name);
        }
        operation()
    };

    let attempts = async {
        match &policy.backoff {
            Some(backoff) => retry(cancel, backoff, &mut counted).await,
            None => tokio::select! {
                biased;
                () = cancel.cancelled() => Err(GuardError::Cancelled.into()),
                result = counted() => result.map_err(Into::into),
            },
        }
    };

    let Some(after) = policy.timeout else {
        return attempts.await;
    };

    if let Ok(result) = tokio::time::timeout(after, attempts).await {
        result
    } else {
        tracing::warn!(
            operation = %policy.name,
            timeout_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
            "Operation deadline exceeded"
        );
        Err(GuardError::Timeout {
            operation: policy.name.clone(),
            after,
        }
        .into())
    }
}
