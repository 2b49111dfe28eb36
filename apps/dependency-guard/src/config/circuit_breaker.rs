//! Circuit breaker settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Circuit breaker settings for one dependency, or the shared defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Time in the open state before a trial call (milliseconds).
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Trial calls admitted while half-open.
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_requests: default_half_open_max_requests(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Convert config settings to the resilience module's `CircuitBreakerConfig`.
    #[must_use]
    pub fn to_resilience_config(&self) -> crate::resilience::CircuitBreakerConfig {
        crate::resilience::CircuitBreakerConfig::new(
            self.max_failures,
            Duration::from_millis(self.reset_timeout_ms),
            self.half_open_max_requests,
        )
    }
}

const fn default_max_failures() -> u32 {
    5
}

const fn default_reset_timeout_ms() -> u64 {
    30_000
}

const fn default_half_open_max_requests() -> u32 {
    1
}
