//! Auto-save queue tuning

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Debounce, batching and retry parameters of the auto-save queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSaveConfig {
    /// Quiet period after the last edit before an entry may be flushed
    #[serde(with = "humantime_serde")]
    pub idle_threshold: Duration,

    /// Period of the background flush loop
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Upper bound on entries taken per flush cycle
    pub max_items_per_batch: usize,

    /// Concurrent saves within a batch
    pub worker_count: usize,

    /// Retries after the first failed attempt; one more failure marks the entry failed
    pub max_retries: u32,

    /// First retry delay; doubles per attempt
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Waiting time after which an entry is promoted one priority tier
    #[serde(with = "humantime_serde")]
    pub promotion_after: Duration,

    /// Terminal entries kept for inspection
    pub history_capacity: usize,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(2),
            flush_interval: Duration::from_millis(500),
            max_items_per_batch: 20,
            worker_count: 4,
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            promotion_after: Duration::from_secs(30),
            history_capacity: 256,
        }
    }
}

impl AutoSaveConfig {
    /// Delay before retry number `attempt` (1-based), capped at `backoff_max`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "flush_interval must be greater than 0".to_string(),
            ));
        }
        if self.max_items_per_batch == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_items_per_batch must be greater than 0".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_count must be greater than 0".to_string(),
            ));
        }
        if self.backoff_max < self.backoff_base {
            return Err(ConfigError::ValidationFailed(
                "backoff_max must not be smaller than backoff_base".to_string(),
            ));
        }
        Ok(())
    }
}
