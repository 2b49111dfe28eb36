//! Retry settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::observability::default_true;
use crate::resilience::BackoffConfig;

/// Exponential backoff settings for one dependency, or the shared defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Delay before the first retry (milliseconds).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor between retries.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on any single delay (milliseconds).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Perturb delays by up to 10%.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
            jitter: true,
        }
    }
}

impl RetrySettings {
    /// Convert to a `BackoffConfig` with the default retry predicate.
    #[must_use]
    pub fn to_backoff_config(&self) -> BackoffConfig {
        BackoffConfig::new(
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
            self.max_retries,
            self.jitter,
        )
    }
}

const fn default_base_delay_ms() -> u64 {
    100
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_max_delay_ms() -> u64 {
    5_000
}

const fn default_max_retries() -> u32 {
    3
}
