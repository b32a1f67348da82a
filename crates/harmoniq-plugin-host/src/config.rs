use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::binding::ActivationConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read host config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse host config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Backoff applied to [`TransientLoadError`](crate::TransientLoadError)s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total load attempts, including the first one.
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            initial_backoff_ms: 20,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Never retries.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (zero based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry as i32);
        Duration::from_secs_f64(self.initial_backoff_ms as f64 * factor as f64 / 1000.0)
    }
}

/// Control-path settings of the instance manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub activation: ActivationConfig,
    pub retry: RetryPolicy,
    /// How many times `initialize` is attempted before a load is abandoned.
    pub initialize_attempts: u32,
    /// Capacity of the diagnostics channel. Excess diagnostics are dropped.
    pub diagnostics_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            activation: ActivationConfig::default(),
            retry: RetryPolicy::default(),
            initialize_attempts: 2,
            diagnostics_capacity: 256,
        }
    }
}

impl HostConfig {
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.activation.sample_rate = sample_rate;
        self
    }

    pub fn with_max_block_size(mut self, frames: u32) -> Self {
        self.activation.max_block_size = frames;
        self
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}
