//! When the next batch runs
//!
//! The worker loop asks its [`Scheduler`] to wait between batches. The
//! [`AdaptiveScheduler`] paces production traffic with an active and an idle
//! interval; the [`ImmediateScheduler`] runs the next batch on the next task
//! tick so tests are deterministic.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, watch};

use crate::clock::Clock;

/// Why a [`Scheduler::wait_next`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The scheduled delay elapsed.
    Elapsed,
    /// [`Scheduler::wake`] cut the wait short.
    Woken,
    /// [`Scheduler::stop`] was called.
    Stopped,
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub mode: &'static str,
    /// Completed waits, whatever ended them
    pub checks: u64,
    pub woken: u64,
    pub is_stopped: bool,
    /// Delay chosen by the most recent wait; `None` for an open-ended wait
    pub last_delay: Option<Duration>,
}

/// Decides when the worker loop processes its next batch.
#[async_trait]
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Delay the next wait would use. `None` means "until woken".
    fn next_delay(&self, queue_is_empty: bool) -> Option<Duration>;

    /// Wait until the next batch is due.
    ///
    /// `queue_is_empty` is `true` when no message is ready; `ready_in` is the
    /// time until the earliest deferred message becomes ready.
    async fn wait_next(&self, queue_is_empty: bool, ready_in: Option<Duration>) -> Wakeup;

    /// Cut an idle wait short, e.g. because work was enqueued.
    fn wake(&self);

    /// Cancel any pending wait; later waits return [`Wakeup::Stopped`] until
    /// [`Scheduler::start`] is called.
    fn stop(&self);

    fn start(&self);

    fn is_stopped(&self) -> bool;

    fn stats(&self) -> SchedulerStats;
}

/// Wake and stop plumbing shared by both schedulers.
#[derive(Debug)]
struct Control {
    wake: Notify,
    stopped: watch::Sender<bool>,
    checks: AtomicU64,
    woken: AtomicU64,
    last_delay: Mutex<Option<Duration>>,
}

impl Control {
    fn new() -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            wake: Notify::new(),
            stopped,
            checks: AtomicU64::new(0),
            woken: AtomicU64::new(0),
            last_delay: Mutex::new(None),
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    fn stop(&self) {
        self.stopped.send_replace(true);
    }

    fn start(&self) {
        self.stopped.send_replace(false);
    }

    /// Wait for `delay` on `clock` (forever when `None`), a wake when
    /// `wakeable`, or a stop.
    async fn wait(&self, clock: &dyn Clock, delay: Option<Duration>, wakeable: bool) -> Wakeup {
        if self.is_stopped() {
            return Wakeup::Stopped;
        }

        *self.last_delay.lock() = delay;
        let mut stopped = self.stopped.subscribe();

        let elapsed = async {
            match delay {
                Some(delay) => clock.sleep(delay).await,
                None => std::future::pending().await,
            }
        };

        let woken = async {
            if wakeable {
                self.wake.notified().await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        let wakeup = tokio::select! {
            biased;

            () = wait_for_stop(&mut stopped) => Wakeup::Stopped,
            () = woken => Wakeup::Woken,
            () = elapsed => Wakeup::Elapsed,
        };

        self.checks.fetch_add(1, Ordering::Relaxed);
        if wakeup == Wakeup::Woken {
            self.woken.fetch_add(1, Ordering::Relaxed);
        }

        wakeup
    }

    fn stats(&self, mode: &'static str) -> SchedulerStats {
        SchedulerStats {
            mode,
            checks: self.checks.load(Ordering::Relaxed),
            woken: self.woken.load(Ordering::Relaxed),
            is_stopped: self.is_stopped(),
            last_delay: *self.last_delay.lock(),
        }
    }
}

async fn wait_for_stop(stopped: &mut watch::Receiver<bool>) {
    // The sender outlives every wait; an error still means "stop".
    let _ = stopped.wait_for(|stopped| *stopped).await;
}

/// Production scheduler: `active_interval` between batches while work is
/// ready, `idle_interval` while the queue is empty, but never later than the
/// earliest deferred message.
#[derive(Debug)]
pub struct AdaptiveScheduler {
    clock: Arc<dyn Clock>,
    active_interval: Duration,
    idle_interval: Duration,
    control: Control,
}

impl AdaptiveScheduler {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, active_interval: Duration, idle_interval: Duration) -> Self {
        Self {
            clock,
            active_interval,
            idle_interval,
            control: Control::new(),
        }
    }
}

#[async_trait]
impl Scheduler for AdaptiveScheduler {
    fn next_delay(&self, queue_is_empty: bool) -> Option<Duration> {
        Some(if queue_is_empty {
            self.idle_interval
        } else {
            self.active_interval
        })
    }

    async fn wait_next(&self, queue_is_empty: bool, ready_in: Option<Duration>) -> Wakeup {
        let delay = self
            .next_delay(queue_is_empty)
            .map(|delay| ready_in.map_or(delay, |ready_in| delay.min(ready_in)));

        self.control
            .wait(self.clock.as_ref(), delay, queue_is_empty)
            .await
    }

    fn wake(&self) {
        self.control.wake.notify_one();
    }

    fn stop(&self) {
        self.control.stop();
    }

    fn start(&self) {
        self.control.start();
    }

    fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }

    fn stats(&self) -> SchedulerStats {
        self.control.stats("adaptive")
    }
}

/// Deterministic scheduler: ready work is processed on the next task tick,
/// deferred work when the clock reaches it, and an empty queue waits for a
/// wake.
#[derive(Debug)]
pub struct ImmediateScheduler {
    clock: Arc<dyn Clock>,
    control: Control,
}

impl ImmediateScheduler {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            control: Control::new(),
        }
    }
}

#[async_trait]
impl Scheduler for ImmediateScheduler {
    fn next_delay(&self, queue_is_empty: bool) -> Option<Duration> {
        (!queue_is_empty).then_some(Duration::ZERO)
    }

    async fn wait_next(&self, queue_is_empty: bool, ready_in: Option<Duration>) -> Wakeup {
        if !queue_is_empty {
            if self.control.is_stopped() {
                return Wakeup::Stopped;
            }

            tokio::task::yield_now().await;
            self.control.checks.fetch_add(1, Ordering::Relaxed);
            *self.control.last_delay.lock() = Some(Duration::ZERO);
            return Wakeup::Elapsed;
        }

        self.control
            .wait(self.clock.as_ref(), ready_in, true)
            .await
    }

    fn wake(&self) {
        self.control.wake.notify_one();
    }

    fn stop(&self) {
        self.control.stop();
    }

    fn start(&self) {
        self.control.start();
    }

    fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }

    fn stats(&self) -> SchedulerStats {
        self.control.stats("immediate")
    }
}
