//! Dependency Guard Binary
//!
//! Watches the configured external dependencies and serves their composite
//! health over HTTP.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin dependency-guard
//! ```
//!
//! # Environment Variables
//!
//! - `DEPENDENCY_GUARD_CONFIG`: Config file path (default: dependency-guard.yaml)
//! - `RUST_LOG`: Log filter, overrides `observability.logging.level`
//!
//! Variables referenced as `${VAR}` in the config file may also come from a
//! `.env` file in the current or any ancestor directory.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dependency_guard::config::load_config;
use dependency_guard::health::monitor_from_config;
use dependency_guard::health::server::HealthServer;
use dependency_guard::observability;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Environment variable naming the config file.
const CONFIG_ENV_VAR: &str = "DEPENDENCY_GUARD_CONFIG";

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let config_path = std::env::var(CONFIG_ENV_VAR).ok();
    let config = load_config(config_path.as_deref()).context("failed to load configuration")?;

    observability::init_tracing(&config.observability.logging)
        .context("failed to initialize logging")?;

    if config.observability.metrics_enabled {
        observability::init_metrics().context("failed to initialize metrics")?;
    }

    tracing::info!(
        service = %config.service.name,
        dependencies = config.dependencies.len(),
        "Starting dependency guard"
    );

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let monitor = Arc::new(monitor_from_config(&config, &client));

    let cancel = CancellationToken::new();
    let server = HealthServer::new(
        config.server.bind_address.clone(),
        config.server.http_port,
        Arc::clone(&monitor),
        cancel.clone(),
    );
    let mut server_handle = tokio::spawn(server.run());

    tokio::select! {
        () = shutdown_signal() => {}
        joined = &mut server_handle => {
            joined.context("health server task failed")??;
            return Ok(());
        }
    }

    cancel.cancel();
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, server_handle).await {
        Ok(joined) => joined.context("health server task failed")??,
        Err(_) => tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Health server did not stop in time"
        ),
    }

    tracing::info!("Dependency guard stopped");
    Ok(())
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
