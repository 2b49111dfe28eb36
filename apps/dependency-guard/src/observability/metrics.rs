//! Prometheus metrics for guarded dependencies.
//!
//! Covers circuit breakers, retries, and health probes. Recording functions
//! are no-ops until a recorder is installed, so library users that never call
//! [`init_metrics`] pay nothing.
//!
//! # Example
//!
//! ```ignore
//! use dependency_guard::observability::{get_metrics_handle, init_metrics};
//!
//! init_metrics()?;
//! let body = get_metrics_handle().map(|h| h.render());
//! ```

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Histogram buckets for probe latency, 1ms to 10s.
const PROBE_LATENCY_BUCKETS: [f64; 10] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0, 2.5, 10.0,
];

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to configure metrics exporter.
    #[error("metrics configuration error: {0}")]
    Configuration(String),
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

/// Install the Prometheus recorder and return its handle.
///
/// Calling this again returns the handle installed by the first call.
/// The handle is rendered by the health server at `GET /metrics`.
///
/// # Errors
///
/// Returns an error if the buckets are rejected or another global recorder
/// is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, MetricsError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets(&PROBE_LATENCY_BUCKETS)
        .map_err(|e| MetricsError::Configuration(e.to_string()))?
        .install_recorder()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    register_metrics();
    tracing::info!("Prometheus metrics recorder installed");

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn register_metrics() {
    describe_gauge!(
        "circuit_breaker_state",
        "Circuit breaker state (0 closed, 1 open, 2 half-open)"
    );
    describe_counter!(
        "circuit_breaker_success_total",
        "Calls recorded as successes by a circuit breaker"
    );
    describe_counter!(
        "circuit_breaker_failures_total",
        "Calls recorded as failures by a circuit breaker"
    );
    describe_counter!(
        "circuit_breaker_rejected_total",
        "Calls rejected by an open circuit breaker"
    );
    describe_counter!(
        "retry_attempts_total",
        "Attempts made after the first one, per operation"
    );
    describe_histogram!(
        "health_check_duration_seconds",
        "Health probe latency by check and kind"
    );
}

// ============================================================================
// Circuit Breaker Metrics
// ============================================================================

/// Update circuit breaker state gauge.
///
/// # Arguments
///
/// * `service` - Breaker name
/// * `state` - Gauge value from `CircuitState::as_gauge`
pub fn record_circuit_breaker_state(service: &str, state: f64) {
    gauge!(
        "circuit_breaker_state",
        "service" => service.to_string()
    )
    .set(state);
}

/// Record a circuit breaker failure.
pub fn record_circuit_breaker_failure(service: &str) {
    counter!(
        "circuit_breaker_failures_total",
        "service" => service.to_string()
    )
    .increment(1);
}

/// Record a circuit breaker success.
pub fn record_circuit_breaker_success(service: &str) {
    counter!(
        "circuit_breaker_success_total",
        "service" => service.to_string()
    )
    .increment(1);
}

/// Record a circuit breaker rejection (call rejected due to open circuit).
pub fn record_circuit_breaker_rejected(service: &str) {
    counter!(
        "circuit_breaker_rejected_total",
        "service" => service.to_string()
    )
    .increment(1);
}

// ============================================================================
// Retry and Health Metrics
// ============================================================================

/// Record one retry (an attempt after the first).
pub fn record_retry_attempt(operation: &str) {
    counter!(
        "retry_attempts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record how long a health probe took.
///
/// # Arguments
///
/// * `check` - Check or dependency name
/// * `kind` - `"check"` or `"dependency"`
/// * `status` - Resulting health status
/// * `duration_seconds` - Probe latency
pub fn record_health_check_duration(check: &str, kind: &str, status: &str, duration_seconds: f64) {
    histogram!(
        "health_check_duration_seconds",
        "check" => check.to_string(),
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .record(duration_seconds);
}
