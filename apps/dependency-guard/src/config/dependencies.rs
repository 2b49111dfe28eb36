//! Guarded dependency definitions and their shared defaults.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::circuit_breaker::CircuitBreakerSettings;
use super::retry::RetrySettings;
use crate::resilience::{CircuitBreaker, ExecutionPolicy};

/// Settings applied to every dependency that does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Circuit breaker defaults.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    /// Retry defaults.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Whole-call deadline (milliseconds).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerSettings::default(),
            retry: RetrySettings::default(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// One external dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Unique dependency name; also the breaker name.
    pub name: String,
    /// URL polled by the health probe.
    pub health_url: String,
    /// Deadline for one health probe (milliseconds).
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
    /// Report as an internal check: failure makes the service unhealthy.
    #[serde(default)]
    pub critical: bool,
    /// Circuit breaker override.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerSettings>,
    /// Retry override.
    #[serde(default)]
    pub retry: Option<RetrySettings>,
    /// Deadline override (milliseconds).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl DependencyConfig {
    /// Effective breaker settings.
    #[must_use]
    pub fn breaker_settings<'a>(
        &'a self,
        defaults: &'a DefaultsConfig,
    ) -> &'a CircuitBreakerSettings {
        self.circuit_breaker
            .as_ref()
            .unwrap_or(&defaults.circuit_breaker)
    }

    /// Effective retry settings.
    #[must_use]
    pub fn retry_settings<'a>(&'a self, defaults: &'a DefaultsConfig) -> &'a RetrySettings {
        self.retry.as_ref().unwrap_or(&defaults.retry)
    }

    /// Effective whole-call deadline.
    #[must_use]
    pub fn timeout(&self, defaults: &DefaultsConfig) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(defaults.timeout_ms))
    }

    /// Health probe deadline.
    #[must_use]
    pub const fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    /// Build the runtime policy, with a fresh breaker named after the dependency.
    #[must_use]
    pub fn policy(&self, defaults: &DefaultsConfig) -> ExecutionPolicy {
        let breaker = CircuitBreaker::new(
            self.name.clone(),
            self.breaker_settings(defaults).to_resilience_config(),
        );
        ExecutionPolicy::new(self.name.clone())
            .with_breaker(Arc::new(breaker))
            .with_timeout(self.timeout(defaults))
            .with_backoff(self.retry_settings(defaults).to_backoff_config())
    }
}

const fn default_timeout_ms() -> u64 {
    10_000
}

const fn default_check_timeout_ms() -> u64 {
    2_000
}
