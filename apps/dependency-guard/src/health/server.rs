//! Health Check and Metrics Endpoint
//!
//! HTTP surface over a [`HealthMonitor`], used by container orchestrators,
//! load balancers, and dashboards.
//!
//! # Endpoints
//!
//! - `GET /health` - Full JSON health report
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (not ready while unhealthy)
//! - `GET /metrics` - Prometheus metrics in text format

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{HealthMonitor, HealthStatus};
use crate::observability::get_metrics_handle;

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to the address.
    #[error("failed to bind health server to {0}: {1}")]
    BindFailed(String, String),

    /// Server failed while running.
    #[error("health server error: {0}")]
    ServerFailed(String),
}

/// Build the health router.
pub fn router(monitor: Arc<HealthMonitor>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(monitor)
}

/// Health check HTTP server.
pub struct HealthServer {
    bind_address: String,
    port: u16,
    monitor: Arc<HealthMonitor>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub fn new(
        bind_address: impl Into<String>,
        port: u16,
        monitor: Arc<HealthMonitor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
            monitor,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = format!("{}:{}", self.bind_address, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(addr.clone(), e.to_string()))?;

        tracing::info!(addr = %addr, "Health server listening");

        axum::serve(listener, router(self.monitor))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(monitor): State<Arc<HealthMonitor>>) -> impl IntoResponse {
    let report = monitor.report().await;
    let status_code = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded | HealthStatus::Unknown => StatusCode::OK,
    };
    (status_code, Json(report))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(monitor): State<Arc<HealthMonitor>>) -> impl IntoResponse {
    if monitor.report().await.status == HealthStatus::Unhealthy {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}
