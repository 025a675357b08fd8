//! Time source abstraction
//!
//! Every timing decision in the pipeline (rate-limit windows, pauses,
//! deferred retries, scheduler waits) goes through a [`Clock`], so tests can
//! drive the whole pipeline with a [`ManualClock`] instead of real time.

use std::{
    fmt,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::watch;

/// A source of monotonic time that can also put the caller to sleep.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current instant.
    fn now(&self) -> Instant;

    /// Sleep for `duration` as measured by this clock.
    async fn sleep(&self, duration: Duration);

    /// Time elapsed since `earlier`, saturating at zero.
    fn since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// Wall-clock time backed by [`Instant`] and `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock that only moves when [`ManualClock::advance`] is called.
///
/// Sleepers wake once the virtual time reaches their deadline.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: watch::Sender<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        let (offset, _) = watch::channel(Duration::ZERO);
        Self {
            origin: Instant::now(),
            offset,
        }
    }

    /// Move virtual time forward, waking every sleeper whose deadline passed.
    pub fn advance(&self, by: Duration) {
        self.offset.send_modify(|offset| *offset += by);
    }

    /// Total virtual time elapsed since the clock was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.offset.borrow()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.borrow()
    }

    async fn sleep(&self, duration: Duration) {
        let mut receiver = self.offset.subscribe();
        let deadline = *receiver.borrow() + duration;

        // The sender lives as long as `self`, so `wait_for` only fails if the
        // clock is dropped mid-sleep; either way the sleep is over.
        let _ = receiver.wait_for(|offset| *offset >= deadline).await;
        tokio::task::yield_now().await;
    }
}
