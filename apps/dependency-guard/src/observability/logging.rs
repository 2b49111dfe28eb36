//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and a fmt
//! layer. `RUST_LOG` takes precedence over the configured level.
//!
//! ```rust,ignore
//! use dependency_guard::observability::init_tracing;
//!
//! init_tracing(&config.observability.logging)?;
//! ```

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Error type for logging setup.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The configured level is not a valid filter directive.
    #[error("invalid log level '{level}': {reason}")]
    InvalidLevel {
        /// Configured level.
        level: String,
        /// Parser message.
        reason: String,
    },
    /// A global subscriber was already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Installation(String),
}

/// Build the filter: `RUST_LOG` if set, otherwise the configured level.
///
/// # Errors
///
/// Returns `LoggingError::InvalidLevel` if the configured level cannot be parsed.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(&config.level).map_err(|e| LoggingError::InvalidLevel {
            level: config.level.clone(),
            reason: e.to_string(),
        })
    })
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Returns a `LoggingError` if the level is invalid or a subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.format == "pretty" {
        registry
            .with(tracing_subscriber::fmt::layer().pretty().with_target(true))
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()
    };

    installed.map_err(|e| LoggingError::Installation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_level_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "dependency_guard=loud".to_string(),
            format: "json".to_string(),
        };
        let Err(err) = build_filter(&config) else {
            panic!("expected invalid level error");
        };
        assert!(err.to_string().contains("invalid log level"));
    }

    #[test]
    fn directive_level_is_accepted() {
        let config = LoggingConfig {
            level: "info,dependency_guard=debug".to_string(),
            format: "pretty".to_string(),
        };
        assert!(build_filter(&config).is_ok());
    }
}
