//! Retry policy for delivery operations.
//!
//! Classifies sink failures and computes backoff. Per-message retry state
//! lives on the [`Message`](crate::message::Message); the policy only keeps
//! decision counters for metrics.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;

use crate::{config::PipelineConfig, policy::backoff::compute_backoff_delay, sink::SinkError};

/// Retry policy configuration and decision counters.
#[derive(Debug)]
pub struct RetryPolicy {
    /// Retry budget used by [`RetryPolicy::should_retry`].
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    /// Randomisation applied to computed delays (±factor).
    pub jitter_factor: f64,
    granted: AtomicU64,
    denied: AtomicU64,
}

/// Retry decisions taken so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RetryStats {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub base_delay: Duration,
    pub max_backoff: Duration,
    pub retries_granted: u64,
    pub retries_denied: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for RetryPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            backoff_multiplier: config.backoff_multiplier,
            max_backoff: config.max_backoff_delay(),
            jitter_factor: config.retry_jitter_factor,
            granted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `error` deserves another attempt after `retry_count`
    /// failures, using the policy's own budget.
    pub fn should_retry(&self, error: &SinkError, retry_count: u32) -> bool {
        self.should_retry_with_budget(error, retry_count, self.max_retries)
    }

    /// Like [`RetryPolicy::should_retry`] for a message carrying its own
    /// retry budget.
    ///
    /// Never `true` once `retry_count >= max_retries`; otherwise `true` only
    /// for transient failures (network, timeout, 408, 5xx).
    pub fn should_retry_with_budget(
        &self,
        error: &SinkError,
        retry_count: u32,
        max_retries: u32,
    ) -> bool {
        let retry = retry_count < max_retries && error.is_transient();

        if retry {
            self.granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }

        retry
    }

    /// `min(max_backoff, base * multiplier^retry_count)`, jittered when a
    /// jitter factor is configured.
    #[must_use]
    pub fn compute_backoff(&self, retry_count: u32) -> Duration {
        compute_backoff_delay(
            retry_count,
            self.base_delay,
            self.backoff_multiplier,
            self.max_backoff,
            self.jitter_factor,
        )
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            max_retries: self.max_retries,
            backoff_multiplier: self.backoff_multiplier,
            base_delay: self.base_delay,
            max_backoff: self.max_backoff,
            retries_granted: self.granted.load(Ordering::Relaxed),
            retries_denied: self.denied.load(Ordering::Relaxed),
        }
    }
}
