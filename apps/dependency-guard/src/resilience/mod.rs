//! Resilience patterns for external service calls.
//!
//! # Call Path
//!
//! ```text
//! execute(policy, cancel, operation)
//!     → circuit_breaker.rs (admit or reject locally, no network)
//!     → timeout (whole retry loop bounded by the policy timeout)
//!     → backoff.rs (attempt, classify, wait, attempt again)
//!     → operation()
//! ```
//!
//! All errors travel as [`BoxError`]. Errors produced by this module are
//! [`GuardError`] values and can be detected anywhere in a source chain with
//! [`is_circuit_open`] and [`is_cancellation`].

mod backoff;
mod circuit_breaker;
mod execute;

use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

pub use backoff::{BackoffConfig, RetryPredicate, retry, retry_service_errors};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, FailurePredicate,
    StateChangeCallback,
};
pub use execute::{ExecutionPolicy, execute};

use crate::error::error_chain;

/// Type-erased operation error.
pub type BoxError = tower::BoxError;

/// Errors produced by the resilience layer itself.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The breaker rejected the call without invoking the operation.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        /// Breaker name.
        name: String,
    },

    /// The policy timeout elapsed before the operation finished.
    #[error("deadline exceeded: operation '{operation}' did not complete within {after:?}")]
    Timeout {
        /// Operation name.
        operation: String,
        /// The timeout that elapsed.
        after: Duration,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Every attempt failed.
    #[error("operation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Total attempts made.
        attempts: u32,
        /// The last failure observed.
        #[source]
        source: BoxError,
    },
}

/// Whether the circuit-open sentinel appears anywhere in the error chain.
///
/// Callers use this to decide whether to fall back to an alternate path.
#[must_use]
pub fn is_circuit_open(error: &(dyn StdError + 'static)) -> bool {
    error_chain(error).any(|e| {
        matches!(
            e.downcast_ref::<GuardError>(),
            Some(GuardError::CircuitOpen { .. })
        )
    })
}

/// Whether the error is a cancellation or deadline signal.
///
/// These are never retried by the default retry predicate.
#[must_use]
pub fn is_cancellation(error: &(dyn StdError + 'static)) -> bool {
    error_chain(error).any(|e| {
        matches!(
            e.downcast_ref::<GuardError>(),
            Some(GuardError::Cancelled | GuardError::Timeout { .. })
        ) || e.is::<tokio::time::error::Elapsed>()
    })
}

/// Whether the caller's own cancellation ended the call.
pub(crate) fn is_caller_cancellation(error: &(dyn StdError + 'static)) -> bool {
    error_chain(error).any(|e| {
        matches!(
            e.downcast_ref::<GuardError>(),
            Some(GuardError::Cancelled)
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_open_is_detected_through_wrapping() {
        let open: BoxError = GuardError::CircuitOpen {
            name: "qdrant".into(),
        }
        .into();
        assert!(is_circuit_open(&*open));

        let wrapped: BoxError = GuardError::RetriesExhausted {
            attempts: 2,
            source: open,
        }
        .into();
        assert!(is_circuit_open(&*wrapped));
        assert!(!is_cancellation(&*wrapped));
    }

    #[test]
    fn cancellation_and_deadlines_are_detected() {
        let cancelled: BoxError = GuardError::Cancelled.into();
        assert!(is_cancellation(&*cancelled));

        let timeout: BoxError = GuardError::Timeout {
            operation: "render".into(),
            after: Duration::from_secs(1),
        }
        .into();
        assert!(is_cancellation(&*timeout));
        assert!(!is_circuit_open(&*timeout));
    }

    #[tokio::test]
    async fn tokio_elapsed_counts_as_deadline() {
        let elapsed = tokio::time::timeout(Duration::from_millis(1), std::future::pending::<()>())
            .await
            .unwrap_err();
        let error: BoxError = elapsed.into();
        assert!(is_cancellation(&*error));
    }

    #[test]
    fn guard_errors_classify_as_expected() {
        use crate::error::{ErrorCode, classify};

        let open: BoxError = GuardError::CircuitOpen {
            name: "kroki".into(),
        }
        .into();
        assert_eq!(
            classify(open, "render diagram").code(),
            ErrorCode::ServiceUnavailable
        );

        let timeout: BoxError = GuardError::Timeout {
            operation: "render".into(),
            after: Duration::from_secs(1),
        }
        .into();
        assert_eq!(classify(timeout, "render diagram").code(), ErrorCode::Timeout);
    }

    #[test]
    fn circuit_open_classification_ignores_breaker_name() {
        use crate::error::{ErrorCode, classify};

        for name in ["llm-timeout-pool", "auth-401-proxy", "rate-limit-cache"] {
            let open: BoxError = GuardError::CircuitOpen { name: name.into() }.into();
            let service_error = classify(open, "generate answer");
            assert_eq!(service_error.code(), ErrorCode::ServiceUnavailable, "{name}");
            assert_eq!(service_error.code().status(), 503);

            let wrapped: BoxError = GuardError::RetriesExhausted {
                attempts: 1,
                source: GuardError::CircuitOpen { name: name.into() }.into(),
            }
            .into();
            assert_eq!(
                classify(wrapped, "generate answer").code(),
                ErrorCode::ServiceUnavailable
            );
        }
    }
}
