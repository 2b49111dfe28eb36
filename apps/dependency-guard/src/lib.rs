// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::items_after_statements,
        clippy::literal_string_with_formatting_args
    )
)]

//! Dependency Guard - Resilience Core
//!
//! Failure semantics for every outbound call to an external service
//! (vector store, rendering API, web search, model endpoint).
//!
//! # Components
//!
//! - **Resilience**: circuit breaker, exponential backoff retrier, and the
//!   `execute` helper that chains breaker → timeout → retry
//! - **Error**: classification of raw errors into user-safe `ServiceError`s
//! - **Health**: composite health reports over checks, dependencies, and
//!   breakers, served over HTTP
//! - **Config**: YAML configuration with environment interpolation
//! - **Observability**: structured logging and Prometheus metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use dependency_guard::resilience::{ExecutionPolicy, execute};
//!
//! let policy = config.dependencies[0].policy(&config.defaults);
//! let hits = execute(&policy, &cancel, || qdrant.search(&query)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Modules
// =============================================================================

/// YAML configuration loading and validation.
pub mod config;

/// Error classification and user-safe service errors.
pub mod error;

/// Composite health reporting and its HTTP surface.
pub mod health;

/// Logging and metrics setup.
pub mod observability;

/// Circuit breaker, retry, and call composition.
pub mod resilience;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{ErrorCode, ErrorResponse, ServiceError, classify};
pub use health::{HealthCheckResult, HealthMonitor, HealthProbe, HealthReport, HealthStatus};
pub use resilience::{
    BackoffConfig, BoxError, CircuitBreaker, CircuitBreakerConfig, CircuitState, ExecutionPolicy,
    GuardError, execute, is_circuit_open, retry,
};
