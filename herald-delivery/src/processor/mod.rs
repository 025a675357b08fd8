//! Single-message delivery
//!
//! The [`Processor`] runs one [`Message`](crate::message::Message) end to end:
//! validate, mark processing, consult the rate limiter, call the sink and
//! classify the outcome. It never touches the queue; signals it returns are
//! acted upon by the pipeline.

pub mod process;

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;

use crate::{clock::Clock, policy::RetryPolicy, rate_limiter::RateLimiter};

/// Processor statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    /// Calls to `process_message`
    pub processed: u64,
    pub succeeded: u64,
    /// Terminal failures, validation failures included
    pub failed: u64,
    pub retryable: u64,
    pub rate_limited: u64,
    pub validation_failures: u64,
    /// Average duration of a sink call
    pub average_send_latency: Duration,
    pub max_send_latency: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    stats: ProcessorStats,
    sends: u32,
    send_latency_total: Duration,
}

impl Counters {
    fn record_send(&mut self, latency: Duration) {
        self.sends = self.sends.saturating_add(1);
        self.send_latency_total += latency;
        self.stats.max_send_latency = self.stats.max_send_latency.max(latency);
        self.stats.average_send_latency = self.send_latency_total / self.sends;
    }
}

/// Executes messages against their sinks.
#[derive(Debug)]
pub struct Processor {
    rate_limiter: Arc<RateLimiter>,
    retry_policy: Arc<RetryPolicy>,
    clock: Arc<dyn Clock>,
    /// Upper bound for a single sink call
    send_timeout: Option<Duration>,
    counters: Mutex<Counters>,
}

impl Processor {
    #[must_use]
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        retry_policy: Arc<RetryPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rate_limiter,
            retry_policy,
            clock,
            send_timeout: None,
            counters: Mutex::new(Counters::default()),
        }
    }

    #[must_use]
    pub fn with_send_timeout(mut self, send_timeout: Option<Duration>) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub const fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub const fn retry_policy(&self) -> &Arc<RetryPolicy> {
        &self.retry_policy
    }

    pub fn stats(&self) -> ProcessorStats {
        self.counters.lock().stats
    }
}
