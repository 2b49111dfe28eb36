//! Configuration module for the dependency guard.
//!
//! Provides configuration loading, validation, and environment variable
//! interpolation for the service and every guarded dependency.
//!
//! # Usage
//!
//! ```rust,ignore
//! use dependency_guard::config::{Config, load_config};
//!
//! // Load from default path (dependency-guard.yaml)
//! let config = load_config(None)?;
//!
//! // Build the guarded call policy for each dependency
//! for dep in &config.dependencies {
//!     let policy = dep.policy(&config.defaults);
//! }
//! ```

mod circuit_breaker;
mod dependencies;
mod observability;
mod retry;
mod server;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use circuit_breaker::CircuitBreakerSettings;
pub use dependencies::{DefaultsConfig, DependencyConfig};
pub use observability::{LOG_FORMATS, LoggingConfig, ObservabilityConfig};
pub use retry::RetrySettings;
pub use server::{ServerConfig, ServiceConfig};

/// Path used when no config path is given.
pub const DEFAULT_CONFIG_PATH: &str = "dependency-guard.yaml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("Failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Service identity.
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Settings shared by all dependencies.
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Guarded dependencies.
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
}

// ============================================
// Configuration Loading
// ============================================

/// Load configuration from a YAML file with environment variable interpolation.
///
/// # Arguments
///
/// * `path` - Optional path to the config file. Defaults to [`DEFAULT_CONFIG_PATH`].
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or(DEFAULT_CONFIG_PATH);

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_string(),
        source: e,
    })?;

    load_config_from_string(&contents)
}

/// Load configuration from a YAML string.
///
/// # Errors
///
/// Returns a `ConfigError` if the YAML cannot be parsed or validated.
pub fn load_config_from_string(yaml: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let config: Config = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax. Unset or empty
/// variables without a default become the empty string.
#[allow(clippy::expect_used)] // Regex is a compile-time constant
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    re.replace_all(input, |cap: &regex::Captures<'_>| {
        let default_value = cap.get(2).map_or("", |m| m.as_str());
        match std::env::var(&cap[1]) {
            Ok(v) if !v.is_empty() => v,
            _ => default_value.to_string(),
        }
    })
    .into_owned()
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

fn validate_breaker(scope: &str, settings: &CircuitBreakerSettings) -> Result<(), ConfigError> {
    if settings.max_failures == 0 {
        return Err(invalid(format!(
            "{scope}.circuit_breaker.max_failures must be at least 1"
        )));
    }
    if settings.half_open_max_requests == 0 {
        return Err(invalid(format!(
            "{scope}.circuit_breaker.half_open_max_requests must be at least 1"
        )));
    }
    if settings.reset_timeout_ms == 0 {
        return Err(invalid(format!(
            "{scope}.circuit_breaker.reset_timeout_ms must be positive"
        )));
    }
    Ok(())
}

fn validate_retry(scope: &str, settings: &RetrySettings) -> Result<(), ConfigError> {
    if !settings.multiplier.is_finite() || settings.multiplier < 1.0 {
        return Err(invalid(format!(
            "{scope}.retry.multiplier must be at least 1.0"
        )));
    }
    if settings.base_delay_ms > settings.max_delay_ms {
        return Err(invalid(format!(
            "{scope}.retry.base_delay_ms must not exceed max_delay_ms"
        )));
    }
    Ok(())
}

/// Validate configuration values.
fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let format = config.observability.logging.format.as_str();
    if !LOG_FORMATS.contains(&format) {
        return Err(invalid(format!(
            "observability.logging.format must be one of: {LOG_FORMATS:?}"
        )));
    }

    validate_breaker("defaults", &config.defaults.circuit_breaker)?;
    validate_retry("defaults", &config.defaults.retry)?;
    if config.defaults.timeout_ms == 0 {
        return Err(invalid("defaults.timeout_ms must be positive"));
    }

    let mut seen = HashSet::new();
    for dep in &config.dependencies {
        if dep.name.trim().is_empty() {
            return Err(invalid("dependency name must not be empty"));
        }
        if !seen.insert(dep.name.as_str()) {
            return Err(invalid(format!("duplicate dependency name '{}'", dep.name)));
        }

        let scope = format!("dependencies.{}", dep.name);
        if let Some(settings) = &dep.circuit_breaker {
            validate_breaker(&scope, settings)?;
        }
        if let Some(settings) = &dep.retry {
            validate_retry(&scope, settings)?;
        }
        if dep.timeout_ms == Some(0) {
            return Err(invalid(format!("{scope}.timeout_ms must be positive")));
        }
        if dep.check_timeout_ms == 0 {
            return Err(invalid(format!("{scope}.check_timeout_ms must be positive")));
        }
    }

    Ok(())
}
