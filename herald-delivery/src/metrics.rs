//! Point-in-time view of a pipeline

use std::time::Duration;

use serde::Serialize;

use crate::{
    pipeline::PipelineState,
    policy::RetryStats,
    processor::ProcessorStats,
    queue::QueueStats,
    rate_limiter::RateLimiterStats,
    scheduler::SchedulerStats,
};

/// Pipeline totals merged with the stats of every component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub state: PipelineState,
    pub closed: bool,
    /// Why the loop is paused, if it is
    pub pause_reason: Option<String>,
    /// Messages admitted through `enqueue` or `send_immediate`
    pub accepted: u64,
    pub succeeded: u64,
    /// Terminal failures, clears excluded
    pub failed: u64,
    pub cleared: u64,
    /// Retryable signals acted upon
    pub retries: u64,
    /// Rate-limit signals of either kind
    pub rate_limit_signals: u64,
    pub in_flight: usize,
    /// Admission to delivery, over delivered messages
    pub average_queue_time: Duration,
    pub max_queue_time: Duration,
    /// Age of the oldest message still waiting, ready or deferred
    pub oldest_pending_age: Option<Duration>,
    /// Deliveries per second since the pipeline was built
    pub throughput: f64,
    pub uptime: Duration,
    pub queue: QueueStats,
    pub rate_limiter: RateLimiterStats,
    pub retry: RetryStats,
    pub processor: ProcessorStats,
    pub scheduler: SchedulerStats,
}

impl PipelineMetrics {
    /// Share of settled messages that were delivered, `None` before any
    /// message settled.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> Option<f64> {
        let settled = self.succeeded + self.failed;
        (settled > 0).then(|| self.succeeded as f64 / settled as f64)
    }
}
