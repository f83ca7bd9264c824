//! Engine configuration.
//!
//! All knobs have conservative defaults; embedding runtimes typically load
//! overrides from their own configuration file and deserialize this struct
//! from it.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for one stream processor instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between health ticks, in milliseconds.
    pub health_tick_interval_ms: u64,
    /// Capacity of the control command queue.
    pub command_channel_capacity: usize,
    /// Default retry policy for transient processing failures, used when a
    /// handler does not supply its own.
    pub retry: RetryConfig,
}

impl EngineConfig {
    pub fn health_tick_interval(&self) -> Duration {
        Duration::from_millis(self.health_tick_interval_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            health_tick_interval_ms: 5_000,
            command_channel_capacity: 64,
            retry: RetryConfig::default(),
        }
    }
}

/// Bounded exponential backoff settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Give up and fail the engine after this many consecutive retries of
    /// one record. `None` retries indefinitely.
    pub max_retries: Option<u32>,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 50,
            max_delay_ms: 10_000,
            max_retries: None,
        }
    }
}
