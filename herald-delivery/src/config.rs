//! Pipeline configuration
//!
//! Every recognised option is an explicit field with a serde default, and the
//! whole struct is validated once when the pipeline is built. Durations are
//! expressed in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when a [`PipelineConfig`] holds unusable values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("backoff_multiplier must be at least 1.0, got {0}")]
    Multiplier(f64),

    #[error("retry_jitter_factor must be within 0.0..=1.0, got {0}")]
    Jitter(f64),

    #[error("max_backoff_delay_ms ({max}) is smaller than retry_base_delay_ms ({base})")]
    BackoffCap { base: u64, max: u64 },
}

/// Configuration for the delivery pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Spacing between proactive send slots, also the `retry_after` reported
    /// when the burst budget is exhausted.
    ///
    /// Default: 1000ms
    #[serde(default = "defaults::base_send_delay_ms")]
    pub base_send_delay_ms: u64,

    /// Maximum number of sends per burst window.
    ///
    /// Default: 5
    #[serde(default = "defaults::burst_allowance")]
    pub burst_allowance: u32,

    /// Length of the burst window.
    ///
    /// Default: 5000ms
    #[serde(default = "defaults::burst_reset_time_ms")]
    pub burst_reset_time_ms: u64,

    /// Retry budget for transient failures.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// First retry delay; later retries grow by `backoff_multiplier`.
    ///
    /// Default: 1000ms
    #[serde(default = "defaults::retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Exponential growth factor between retries.
    ///
    /// Default: 2.0
    #[serde(default = "defaults::backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Cap for the computed backoff.
    ///
    /// Default: 30000ms
    #[serde(default = "defaults::max_backoff_delay_ms")]
    pub max_backoff_delay_ms: u64,

    /// Randomisation applied to retry delays (±factor).
    ///
    /// Default: 0.0 (deterministic)
    #[serde(default)]
    pub retry_jitter_factor: f64,

    /// Messages processed concurrently within one batch.
    ///
    /// Default: 1
    #[serde(default = "defaults::max_concurrent_processing")]
    pub max_concurrent_processing: usize,

    /// Select the deterministic scheduler instead of the adaptive timer.
    #[serde(default)]
    pub test_mode: bool,

    /// Start the worker loop on the first `enqueue`.
    ///
    /// Default: true
    #[serde(default = "defaults::auto_start")]
    pub auto_start: bool,

    /// Delay between batches while work is waiting.
    ///
    /// Default: 100ms
    #[serde(default = "defaults::active_check_interval_ms")]
    pub active_check_interval_ms: u64,

    /// Delay between checks while the queue is empty.
    ///
    /// Default: 1000ms
    #[serde(default = "defaults::idle_check_interval_ms")]
    pub idle_check_interval_ms: u64,

    /// Safety margin added to every sink-reported retry-after.
    ///
    /// Default: 500ms
    #[serde(default = "defaults::rate_limit_buffer_ms")]
    pub rate_limit_buffer_ms: u64,

    /// Pause used when the sink reports a rate limit without any hint.
    ///
    /// Default: 1000ms
    #[serde(default = "defaults::default_retry_after_ms")]
    pub default_retry_after_ms: u64,

    /// Ceiling for a sink-requested pause, buffer included.
    ///
    /// Default: 3600000ms (1 hour)
    #[serde(default = "defaults::max_rate_limit_pause_ms")]
    pub max_rate_limit_pause_ms: u64,

    /// Upper bound for one `send` call; exceeding it counts as a transient
    /// timeout. `None` waits forever.
    #[serde(default)]
    pub send_timeout_ms: Option<u64>,

    /// Priority used by `send_immediate`.
    ///
    /// Default: 1000
    #[serde(default = "defaults::immediate_priority")]
    pub immediate_priority: i32,

    /// Buffered delivery events per subscriber.
    ///
    /// Default: 256
    #[serde(default = "defaults::event_capacity")]
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_send_delay_ms: defaults::base_send_delay_ms(),
            burst_allowance: defaults::burst_allowance(),
            burst_reset_time_ms: defaults::burst_reset_time_ms(),
            max_retries: defaults::max_retries(),
            retry_base_delay_ms: defaults::retry_base_delay_ms(),
            backoff_multiplier: defaults::backoff_multiplier(),
            max_backoff_delay_ms: defaults::max_backoff_delay_ms(),
            retry_jitter_factor: 0.0,
            max_concurrent_processing: defaults::max_concurrent_processing(),
            test_mode: false,
            auto_start: defaults::auto_start(),
            active_check_interval_ms: defaults::active_check_interval_ms(),
            idle_check_interval_ms: defaults::idle_check_interval_ms(),
            rate_limit_buffer_ms: defaults::rate_limit_buffer_ms(),
            default_retry_after_ms: defaults::default_retry_after_ms(),
            max_rate_limit_pause_ms: defaults::max_rate_limit_pause_ms(),
            send_timeout_ms: None,
            immediate_priority: defaults::immediate_priority(),
            event_capacity: defaults::event_capacity(),
        }
    }
}

impl PipelineConfig {
    /// Check every value for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero: [(&'static str, u64); 5] = [
            ("burst_allowance", u64::from(self.burst_allowance)),
            ("burst_reset_time_ms", self.burst_reset_time_ms),
            ("max_concurrent_processing", self.max_concurrent_processing as u64),
            ("event_capacity", self.event_capacity as u64),
            ("max_rate_limit_pause_ms", self.max_rate_limit_pause_ms),
        ];

        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }

        if self.send_timeout_ms == Some(0) {
            return Err(ConfigError::Zero {
                field: "send_timeout_ms",
            });
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Multiplier(self.backoff_multiplier));
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            return Err(ConfigError::Jitter(self.retry_jitter_factor));
        }

        if self.max_backoff_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::BackoffCap {
                base: self.retry_base_delay_ms,
                max: self.max_backoff_delay_ms,
            });
        }

        Ok(())
    }

    pub const fn base_send_delay(&self) -> Duration {
        Duration::from_millis(self.base_send_delay_ms)
    }

    pub const fn burst_reset_time(&self) -> Duration {
        Duration::from_millis(self.burst_reset_time_ms)
    }

    pub const fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub const fn max_backoff_delay(&self) -> Duration {
        Duration::from_millis(self.max_backoff_delay_ms)
    }

    pub const fn active_check_interval(&self) -> Duration {
        Duration::from_millis(self.active_check_interval_ms)
    }

    pub const fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    pub const fn rate_limit_buffer(&self) -> Duration {
        Duration::from_millis(self.rate_limit_buffer_ms)
    }

    pub const fn default_retry_after(&self) -> Duration {
        Duration::from_millis(self.default_retry_after_ms)
    }

    pub const fn max_rate_limit_pause(&self) -> Duration {
        Duration::from_millis(self.max_rate_limit_pause_ms)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }
}

mod defaults {
    pub const fn base_send_delay_ms() -> u64 {
        1000
    }

    pub const fn burst_allowance() -> u32 {
        5
    }

    pub const fn burst_reset_time_ms() -> u64 {
        5000
    }

    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn retry_base_delay_ms() -> u64 {
        1000
    }

    pub const fn backoff_multiplier() -> f64 {
        2.0
    }

    pub const fn max_backoff_delay_ms() -> u64 {
        30_000
    }

    pub const fn max_concurrent_processing() -> usize {
        1
    }

    pub const fn auto_start() -> bool {
        true
    }

    pub const fn active_check_interval_ms() -> u64 {
        100
    }

    pub const fn idle_check_interval_ms() -> u64 {
        1000
    }

    pub const fn rate_limit_buffer_ms() -> u64 {
        500
    }

    pub const fn default_retry_after_ms() -> u64 {
        1000
    }

    pub const fn max_rate_limit_pause_ms() -> u64 {
        3_600_000
    }

    pub const fn immediate_priority() -> i32 {
        1000
    }

    pub const fn event_capacity() -> usize {
        256
    }
}
