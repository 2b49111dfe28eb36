//! Circuit breaker for external dependencies.
//!
//! Stops calling a failing dependency until it is likely to have recovered.
//! The breaker only gates admission: it never retries and never sleeps, and
//! a rejection is a local decision made without any network attempt.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN       consecutive failures reach max_failures
//! OPEN → HALF_OPEN    first call after reset_timeout (admitted as a trial)
//! HALF_OPEN → CLOSED  half_open_max_requests trial successes
//! HALF_OPEN → OPEN    any trial failure
//! ```
//!
//! # Concurrency
//!
//! All mutable fields sit behind one `RwLock`. The guarded operation runs
//! with no lock held. Rejections in OPEN only take the read lock; admission
//! that must mutate re-checks the state under the write lock. State-change
//! callbacks run on a detached task after the lock is released, so a callback
//! may call back into the same breaker.
//!
//! # Example
//!
//! ```rust,ignore
//! use dependency_guard::resilience::{CircuitBreaker, CircuitBreakerConfig, is_circuit_open};
//!
//! let breaker = CircuitBreaker::new("qdrant", CircuitBreakerConfig::default());
//! match breaker.execute(&cancel, || client.search(&query)).await {
//!     Ok(hits) => render(hits),
//!     Err(e) if is_circuit_open(&*e) => fallback(),
//!     Err(e) => return Err(e),
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{BoxError, GuardError, is_caller_cancellation};
use crate::observability;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// A limited number of trial calls are admitted.
    HalfOpen,
}

impl CircuitState {
    /// Gauge value used for metrics.
    #[must_use]
    pub const fn as_gauge(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Decides whether an operation error counts as a breaker failure.
///
/// Errors for which this returns `false` are treated as successes.
pub type FailurePredicate = Arc<dyn Fn(&BoxError) -> bool + Send + Sync>;

/// Notified with `(name, from, to)` after every state change.
pub type StateChangeCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Circuit breaker configuration.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub max_failures: u32,
    /// Time to stay OPEN before admitting a trial call.
    pub reset_timeout: Duration,
    /// Trial calls admitted in HALF_OPEN, and successes needed to close.
    pub half_open_max_requests: u32,
    /// Failure classification.
    pub is_failure: FailurePredicate,
    /// Optional state-change observer.
    pub on_state_change: Option<StateChangeCallback>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
            is_failure: Arc::new(|_| true),
            on_state_change: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("max_failures", &self.max_failures)
            .field("reset_timeout", &self.reset_timeout)
            .field("half_open_max_requests", &self.half_open_max_requests)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration with the default failure predicate.
    #[must_use]
    pub fn new(max_failures: u32, reset_timeout: Duration, half_open_max_requests: u32) -> Self {
        Self {
            max_failures,
            reset_timeout,
            half_open_max_requests,
            ..Self::default()
        }
    }

    /// Replace the failure predicate.
    #[must_use]
    pub fn with_failure_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&BoxError) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Arc::new(predicate);
        self
    }

    /// Set the state-change callback.
    #[must_use]
    pub fn on_state_change<C>(mut self, callback: C) -> Self
    where
        C: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted toward opening.
    pub failures: u32,
    /// Calls admitted since the last state change.
    pub requests: u32,
    /// Cumulative successful calls.
    pub successful_requests: u64,
    /// Cumulative failed calls.
    pub failed_requests: u64,
    /// Time of the last failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Time of the last success.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Time of the last state change.
    pub state_changed_at: DateTime<Utc>,
    /// Seconds since the breaker was created.
    pub uptime_secs: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Bumped on every transition; outcomes from older generations only touch totals.
    generation: u64,
    failures: u32,
    requests: u32,
    half_open_successes: u32,
    successful_requests: u64,
    failed_requests: u64,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    state_changed_at: DateTime<Utc>,
    entered_state_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
}

/// Circuit breaker for one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    created_at: Instant,
    inner: RwLock<BreakerState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a breaker in the CLOSED state.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        let name = name.into();
        observability::record_circuit_breaker_state(&name, CircuitState::Closed.as_gauge());
        Self {
            name,
            config,
            created_at: now,
            inner: RwLock::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                failures: 0,
                requests: 0,
                half_open_successes: 0,
                successful_requests: 0,
                failed_requests: 0,
                last_failure_at: None,
                last_success_at: None,
                state_changed_at: Utc::now(),
                entered_state_at: now,
            }),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state.
    ///
    /// An OPEN breaker whose reset timeout has elapsed still reports OPEN
    /// until the next call moves it to HALF_OPEN.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    /// Snapshot of the breaker's counters.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.read();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            requests: inner.requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            state_changed_at: inner.state_changed_at,
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Run `operation` if the breaker admits it.
    ///
    /// Returns [`GuardError::CircuitOpen`] without invoking the operation when
    /// the breaker rejects the call. Otherwise the operation's own result is
    /// returned after the outcome has been recorded.
    ///
    /// A call that ends in [`GuardError::Cancelled`] after `cancel` fired is
    /// treated like an abandoned call: its slot is released and no outcome is
    /// recorded.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, BoxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if cancel.is_cancelled() {
            return Err(GuardError::Cancelled.into());
        }

        let permit = self.admit()?;

        match operation().await {
            Ok(value) => {
                permit.settle(true);
                Ok(value)
            }
            Err(e) => {
                let error: BoxError = e.into();
                if cancel.is_cancelled() && is_caller_cancellation(&*error) {
                    drop(permit);
                    return Err(error);
                }
                let failed = (self.config.is_failure)(&error);
                permit.settle(!failed);
                Err(error)
            }
        }
    }

    /// Force the breaker OPEN (operator override).
    pub fn force_open(&self) {
        self.force(CircuitState::Open);
    }

    /// Force the breaker CLOSED (operator override).
    pub fn force_close(&self) {
        self.force(CircuitState::Closed);
    }

    fn force(&self, to: CircuitState) {
        let transition = {
            let mut inner = self.inner.write();
            (inner.state != to).then(|| Self::transition(&mut inner, to))
        };
        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    fn rejection(&self) -> GuardError {
        observability::record_circuit_breaker_rejected(&self.name);
        tracing::debug!(name = %self.name, "Circuit breaker rejected call");
        GuardError::CircuitOpen {
            name: self.name.clone(),
        }
    }

    fn admit(&self) -> Result<Permit<'_>, GuardError> {
        let half_open_limit = self.config.half_open_max_requests.max(1);

        // Fast path: reject under the read lock.
        {
            let inner = self.inner.read();
            let rejected = match inner.state {
                CircuitState::Open => inner.entered_state_at.elapsed() < self.config.reset_timeout,
                CircuitState::HalfOpen => inner.requests >= half_open_limit,
                CircuitState::Closed => false,
            };
            if rejected {
                drop(inner);
                return Err(self.rejection());
            }
        }

        let mut inner = self.inner.write();
        let mut transition = None;

        if inner.state == CircuitState::Open {
            if inner.entered_state_at.elapsed() < self.config.reset_timeout {
                drop(inner);
                return Err(self.rejection());
            }
            transition = Some(Self::transition(&mut inner, CircuitState::HalfOpen));
        }

        if inner.state == CircuitState::HalfOpen && inner.requests >= half_open_limit {
            drop(inner);
            return Err(self.rejection());
        }

        inner.requests = inner.requests.saturating_add(1);
        let generation = inner.generation;
        drop(inner);

        if let Some(transition) = transition {
            self.announce(transition);
        }

        Ok(Permit {
            breaker: self,
            generation,
            settled: false,
        })
    }

    fn record(&self, generation: u64, success: bool) {
        let transition = {
            let mut inner = self.inner.write();
            let now = Utc::now();

            if success {
                inner.successful_requests += 1;
                inner.last_success_at = Some(now);
            } else {
                inner.failed_requests += 1;
                inner.last_failure_at = Some(now);
            }

            if inner.generation != generation {
                None
            } else {
                match (inner.state, success) {
                    (CircuitState::Closed, true) => {
                        inner.failures = 0;
                        None
                    }
                    (CircuitState::Closed, false) => {
                        inner.failures = inner.failures.saturating_add(1);
                        (inner.failures >= self.config.max_failures)
                            .then(|| Self::transition(&mut inner, CircuitState::Open))
                    }
                    (CircuitState::HalfOpen, true) => {
                        inner.half_open_successes += 1;
                        (inner.half_open_successes >= self.config.half_open_max_requests.max(1))
                            .then(|| Self::transition(&mut inner, CircuitState::Closed))
                    }
                    (CircuitState::HalfOpen, false) => {
                        inner.failures = inner.failures.saturating_add(1);
                        Some(Self::transition(&mut inner, CircuitState::Open))
                    }
                    (CircuitState::Open, _) => None,
                }
            }
        };

        if success {
            observability::record_circuit_breaker_success(&self.name);
        } else {
            observability::record_circuit_breaker_failure(&self.name);
        }

        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    /// Give back an admission slot whose call never reported an outcome.
    fn release(&self, generation: u64) {
        let mut inner = self.inner.write();
        if inner.generation == generation {
            inner.requests = inner.requests.saturating_sub(1);
        }
    }

    fn transition(inner: &mut BreakerState, to: CircuitState) -> Transition {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.requests = 0;
        inner.half_open_successes = 0;
        if to == CircuitState::Closed {
            inner.failures = 0;
        }
        inner.entered_state_at = Instant::now();
        inner.state_changed_at = Utc::now();
        Transition { from, to }
    }

    /// Log, export, and notify a transition. Never called with the lock held.
    fn announce(&self, transition: Transition) {
        let Transition { from, to } = transition;

        match to {
            CircuitState::Open => tracing::warn!(
                name = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => tracing::info!(
                name = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker testing"
            ),
            CircuitState::Closed => tracing::info!(
                name = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker closed"
            ),
        }
        observability::record_circuit_breaker_state(&self.name, to.as_gauge());

        if let Some(callback) = &self.config.on_state_change {
            let callback = Arc::clone(callback);
            let name = self.name.clone();
            let notify = move || callback(&name, from, to);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { notify() });
                }
                Err(_) => {
                    std::thread::spawn(notify);
                }
            }
        }
    }
}

/// An admitted call. Records its outcome once, or releases its slot on drop.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.record(self.generation, success);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation);
        }
    }
}
