//! Observability module for metrics and logging.
//!
//! Prometheus metrics are rendered by the health server; logs go to stdout
//! through `tracing-subscriber`.

mod logging;
mod metrics;

pub use logging::{LoggingError, build_filter, init_tracing};
pub use self::metrics::{
    MetricsError, get_metrics_handle, init_metrics, record_circuit_breaker_failure,
    record_circuit_breaker_rejected, record_circuit_breaker_state, record_circuit_breaker_success,
    record_health_check_duration, record_retry_attempt,
};
