//! The delivery pipeline
//!
//! [`DeliveryPipeline`] composes the queue, rate limiter, retry policy,
//! processor and scheduler behind a small API. Producers `enqueue` messages
//! and await their [`DeliveryHandle`]; a single worker task pulls batches
//! from the queue whenever the scheduler says so, and acts on the signals
//! the processor returns:
//!
//! - retryable failure: deferred by the computed backoff
//! - proactive rate limit: deferred by the limiter's `retry_after`
//! - reactive rate limit: re-enqueued ready, the loop pauses and resumes by
//!   itself after `retry_after`
//!
//! Re-enqueued messages keep their priority and admission order.

mod state;
mod worker;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use herald_common::{internal, tracing};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    runtime::Handle,
    sync::{broadcast, watch},
    task::JoinHandle,
};

pub use self::state::PipelineState;
use crate::{
    clock::{Clock, SystemClock},
    config::PipelineConfig,
    error::{DeliveryError, PipelineError},
    events::{DeliveryEvent, EventBus},
    message::{
        Content, DEFAULT_PRIORITY, DeliveryHandle, DeliveryOptions, DeliveryReceipt, Message,
        MessageId,
    },
    metrics::PipelineMetrics,
    policy::RetryPolicy,
    processor::Processor,
    queue::DeliveryQueue,
    rate_limiter::{RateLimitConfig, RateLimiter},
    scheduler::{AdaptiveScheduler, ImmediateScheduler, Scheduler},
    sink::Sink,
};

/// Reason given to messages rejected when the pipeline shuts down.
pub const SHUTDOWN_REASON: &str = "shutdown";

/// Builder for [`DeliveryPipeline`]
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source for rate-limit windows, pauses and deferred retries.
    ///
    /// Default: [`SystemClock`]
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the scheduler chosen from `test_mode`.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Validate the configuration and assemble the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the configuration is
    /// unusable.
    pub fn build(self) -> Result<DeliveryPipeline, PipelineError> {
        let config = self.config;
        config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None if config.test_mode => Arc::new(ImmediateScheduler::new(Arc::clone(&clock))),
            None => Arc::new(AdaptiveScheduler::new(
                Arc::clone(&clock),
                config.active_check_interval(),
                config.idle_check_interval(),
            )),
        };

        let rate_limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::from(&config),
            Arc::clone(&clock),
        ));
        let retry_policy = Arc::new(RetryPolicy::from(&config));
        let processor = Arc::new(
            Processor::new(
                Arc::clone(&rate_limiter),
                Arc::clone(&retry_policy),
                Arc::clone(&clock),
            )
            .with_send_timeout(config.send_timeout()),
        );

        let (state, _) = watch::channel(PipelineState::Idle);
        let (progress, _) = watch::channel(0);

        internal!(
            level = DEBUG,
            "Delivery pipeline built: burst {}/{}ms, max_retries {}, concurrency {}, scheduler {}",
            config.burst_allowance,
            config.burst_reset_time_ms,
            config.max_retries,
            config.max_concurrent_processing,
            scheduler.stats().mode
        );

        Ok(DeliveryPipeline {
            inner: Arc::new(Inner {
                events: EventBus::new(config.event_capacity),
                created_at: clock.now(),
                config,
                clock,
                queue: DeliveryQueue::new(),
                rate_limiter,
                retry_policy,
                processor,
                scheduler,
                state,
                pause: Mutex::new(PauseState::default()),
                progress,
                processing: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                worker: Mutex::new(None),
                totals: Mutex::new(Totals::default()),
            }),
        })
    }
}

/// Outcome of [`DeliveryPipeline::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// The queue emptied before the timeout.
    pub drained: bool,
    /// The worker finished its in-flight batch before the timeout.
    pub stopped: bool,
    /// Messages rejected because they were still pending.
    pub cleared: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    accepted: u64,
    succeeded: u64,
    failed: u64,
    cleared: u64,
    retries: u64,
    rate_limit_signals: u64,
    queue_time_total: Duration,
    max_queue_time: Duration,
}

impl Totals {
    fn record_success(&mut self, queued_for: Duration) {
        self.succeeded += 1;
        self.queue_time_total += queued_for;
        self.max_queue_time = self.max_queue_time.max(queued_for);
    }
}

#[derive(Debug, Default)]
struct PauseState {
    /// Bumped by every pause and resume; a scheduled auto-resume only fires
    /// if the generation it captured is still current.
    generation: u64,
    /// The current pause was set by a sink rate limit.
    automatic: bool,
    reason: Option<String>,
}

#[derive(Debug)]
struct Inner {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    queue: DeliveryQueue,
    rate_limiter: Arc<RateLimiter>,
    retry_policy: Arc<RetryPolicy>,
    processor: Arc<Processor>,
    scheduler: Arc<dyn Scheduler>,
    events: EventBus,
    state: watch::Sender<PipelineState>,
    pause: Mutex<PauseState>,
    /// Bumped whenever a message settles or leaves the in-flight set.
    progress: watch::Sender<u64>,
    /// Set while a batch runs.
    processing: AtomicBool,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    sequence: AtomicU64,
    /// Identifies the current worker; a worker exits once it is replaced.
    epoch: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    totals: Mutex<Totals>,
    created_at: Instant,
}

impl Inner {
    fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Move to `to` if the current state satisfies `from`.
    fn transition(&self, from: impl FnOnce(PipelineState) -> bool, to: PipelineState) -> bool {
        self.state.send_if_modified(|state| {
            if from(*state) && *state != to {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn emit(&self, event: DeliveryEvent) {
        self.events.emit(event);
    }

    fn bump_progress(&self) {
        self.progress.send_modify(|progress| *progress = progress.wrapping_add(1));
    }

    fn publish_gauges(&self) {
        if let Some(metrics) = herald_metrics::metrics() {
            let gauge = |value: usize| u64::try_from(value).unwrap_or(u64::MAX);
            metrics.delivery.set_queue_size(
                gauge(self.queue.ready_len()),
                gauge(self.queue.deferred_len()),
            );
            metrics
                .delivery
                .set_in_flight(gauge(self.in_flight.load(Ordering::SeqCst)));
        }
    }

    /// Pause for a sink rate limit. Returns the pause generation to resume,
    /// or `None` if a manual pause (or a stopped loop) takes precedence.
    fn pause_automatic(&self, reason: String) -> Option<u64> {
        let mut pause = self.pause.lock();

        match self.state() {
            PipelineState::Running => {}
            PipelineState::Paused if pause.automatic => {}
            _ => return None,
        }

        pause.generation += 1;
        pause.automatic = true;
        pause.reason = Some(reason.clone());

        if self.transition(|state| state == PipelineState::Running, PipelineState::Paused) {
            self.emit(DeliveryEvent::Paused { reason });
        }

        Some(pause.generation)
    }

    fn pause_manual(&self, reason: &str) -> bool {
        let mut pause = self.pause.lock();

        if !self.state().is_active() {
            return false;
        }

        pause.generation += 1;
        pause.automatic = false;
        pause.reason = Some(reason.to_string());

        if self.transition(|state| state == PipelineState::Running, PipelineState::Paused) {
            internal!(level = INFO, "Delivery pipeline paused: {reason}");
            self.emit(DeliveryEvent::Paused {
                reason: reason.to_string(),
            });
        }

        true
    }

    /// Resume if paused and, when `generation` is given, only if no one
    /// changed the pause since.
    fn resume(&self, generation: Option<u64>) -> bool {
        let mut pause = self.pause.lock();

        if generation.is_some_and(|generation| generation != pause.generation) {
            tracing::debug!("Pause changed since it was scheduled, not resuming");
            return false;
        }

        if !self.transition(|state| state == PipelineState::Paused, PipelineState::Running) {
            return false;
        }

        pause.generation += 1;
        pause.automatic = false;
        pause.reason = None;
        drop(pause);

        internal!(level = INFO, "Delivery pipeline resumed");
        self.emit(DeliveryEvent::Resumed);
        self.scheduler.wake();
        true
    }

    fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0
    }

    async fn wait_drained(&self) {
        let mut progress = self.progress.subscribe();

        while !self.is_drained() {
            if progress.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Rate-limited priority delivery pipeline.
///
/// Cheap to clone; clones share the same queue and worker.
#[derive(Debug, Clone)]
pub struct DeliveryPipeline {
    inner: Arc<Inner>,
}

impl DeliveryPipeline {
    /// Build a pipeline with the default clock and scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the configuration is
    /// unusable.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::builder().with_config(config).build()
    }

    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn state(&self) -> PipelineState {
        self.inner.state()
    }

    /// `true` once [`DeliveryPipeline::shutdown`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Pending messages, deferred ones included.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.size()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.rate_limiter
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.inner.events.subscribe()
    }

    /// Queue `content` for delivery to `sink`.
    ///
    /// The returned handle resolves once the message is delivered or fails
    /// for good. Starts the worker if the pipeline is idle and `auto_start`
    /// is set. After shutdown the handle is rejected with
    /// [`DeliveryError::Closed`].
    pub fn enqueue(
        &self,
        sink: Arc<dyn Sink>,
        content: impl Into<Content>,
        options: DeliveryOptions,
    ) -> DeliveryHandle {
        let priority = options.priority.unwrap_or(DEFAULT_PRIORITY);
        let mut message = self.build_message(sink, content.into(), options, priority);
        let handle = message.completion_handle();

        if self.is_closed() {
            tracing::warn!(message_id = %message.id(), "Refusing message, pipeline is closed");
            message.mark_failed(DeliveryError::Closed, self.inner.clock.now());
            return handle;
        }

        let id = message.id();
        self.inner.queue.enqueue(message);
        self.inner.totals.lock().accepted += 1;
        if let Some(metrics) = herald_metrics::metrics() {
            metrics.delivery.record_accepted(false);
        }
        self.inner.publish_gauges();
        self.inner.emit(DeliveryEvent::Queued { id, priority });

        tracing::debug!(message_id = %id, priority, "Message queued");

        if self.inner.config.auto_start
            && self.state() == PipelineState::Idle
            && let Err(error) = self.start()
        {
            tracing::warn!(%error, "Unable to auto-start delivery pipeline");
        }

        self.inner.scheduler.wake();
        handle
    }

    /// Deliver `content` right away, bypassing the queue and scheduler.
    ///
    /// Unlike [`DeliveryPipeline::enqueue`], signals are returned to the
    /// caller instead of being retried.
    ///
    /// # Errors
    ///
    /// Returns whatever the processor returned for this single attempt, or
    /// [`DeliveryError::Closed`] after shutdown.
    pub async fn send_immediate(
        &self,
        sink: Arc<dyn Sink>,
        content: impl Into<Content>,
        options: DeliveryOptions,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }

        let priority = self.inner.config.immediate_priority;
        let mut message = self.build_message(sink, content.into(), options, priority);
        let id = message.id();

        self.inner.totals.lock().accepted += 1;
        if let Some(metrics) = herald_metrics::metrics() {
            metrics.delivery.record_accepted(true);
        }

        let result = self.inner.processor.process_message(&mut message).await;

        match &result {
            Ok(receipt) => {
                self.inner.totals.lock().record_success(receipt.queued_for);
                self.inner.emit(DeliveryEvent::Sent {
                    id,
                    attempts: receipt.attempts,
                });
            }
            Err(DeliveryError::RateLimited { kind, retry_after }) => {
                self.inner.totals.lock().rate_limit_signals += 1;
                self.inner.emit(DeliveryEvent::RateLimited {
                    id,
                    kind: *kind,
                    retry_after: *retry_after,
                });
            }
            Err(DeliveryError::Retryable { .. }) => {}
            Err(error) => {
                self.inner.totals.lock().failed += 1;
                self.inner.emit(DeliveryEvent::Failed {
                    id,
                    error: error.to_string(),
                });
            }
        }

        result
    }

    /// Start the worker loop. No-op if it is already running or paused.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Closed`] if the pipeline was shut down and stopped
    /// - [`PipelineError::NoRuntime`] outside a tokio runtime
    pub fn start(&self) -> Result<(), PipelineError> {
        let inner = &self.inner;
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        let mut worker = inner.worker.lock();
        match inner.state() {
            PipelineState::Running | PipelineState::Paused => return Ok(()),
            PipelineState::Stopped if inner.is_closed() => return Err(PipelineError::Closed),
            PipelineState::Idle | PipelineState::Stopped => {}
        }

        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        inner.scheduler.start();
        inner.state.send_replace(PipelineState::Running);
        *worker = Some(runtime.spawn(worker::run(Arc::clone(inner), epoch)));

        internal!(level = INFO, "Delivery pipeline started");
        Ok(())
    }

    /// Stop scheduling batches and wait up to `timeout` for the in-flight
    /// batch. In-flight sends are never aborted; on timeout they finish in
    /// the background.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::StopTimeout`] if the batch outlived `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<(), PipelineError> {
        let stopped = self
            .inner
            .transition(PipelineState::is_active, PipelineState::Stopped);
        self.inner.scheduler.stop();

        if stopped {
            internal!(level = INFO, "Delivery pipeline stopping");
            self.inner.emit(DeliveryEvent::Stopped);
        }

        let worker = self.inner.worker.lock().take();
        let Some(worker) = worker else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                tracing::error!(%error, "Delivery worker terminated abnormally");
                Ok(())
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis(),
                    in_flight = self.inner.in_flight.load(Ordering::SeqCst),
                    "Delivery worker did not stop in time, in-flight sends continue in the background"
                );
                Err(PipelineError::StopTimeout(timeout))
            }
        }
    }

    /// Halt scheduling until [`DeliveryPipeline::resume`]. Independent of the
    /// rate limiter's own pause; cancels a pending automatic resume.
    ///
    /// Returns `false` if the loop is not running.
    pub fn pause(&self, reason: &str) -> bool {
        self.inner.pause_manual(reason)
    }

    /// Continue after a pause. Returns `false` if the loop was not paused.
    pub fn resume(&self) -> bool {
        self.inner.resume(None)
    }

    /// Reject every pending message with an error whose message is `reason`.
    pub fn clear(&self, reason: &str) -> Vec<MessageId> {
        let inner = &self.inner;
        let cleared = inner.queue.clear(reason, inner.clock.now());

        if !cleared.is_empty() {
            let count = cleared.len();
            inner.totals.lock().cleared += count as u64;
            if let Some(metrics) = herald_metrics::metrics() {
                metrics.delivery.record_cleared(count as u64);
            }

            tracing::info!(count, reason, "Cleared pending messages");
            inner.emit(DeliveryEvent::Cleared {
                count,
                reason: reason.to_string(),
            });
        }

        inner.publish_gauges();
        inner.bump_progress();
        cleared
    }

    /// Refuse new work, drain the queue until it is empty or `timeout`
    /// elapses, then stop and clear whatever is left.
    ///
    /// A pause is not overridden: a paused pipeline only drains once it
    /// resumes.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();

        if !self.state().is_active()
            && let Err(error) = self.start()
        {
            tracing::warn!(%error, "Unable to start delivery pipeline for draining");
        }
        self.inner.closed.store(true, Ordering::SeqCst);

        internal!(
            level = INFO,
            "Shutting down delivery pipeline with {} pending message(s)",
            self.queue_len()
        );

        self.inner.scheduler.wake();
        let drained = tokio::time::timeout(timeout, self.inner.wait_drained())
            .await
            .is_ok();

        if !drained {
            tracing::warn!(
                pending = self.queue_len(),
                "Delivery pipeline did not drain before the shutdown timeout"
            );
        }

        let stopped = self
            .stop(timeout.saturating_sub(started.elapsed()))
            .await
            .is_ok();
        let cleared = self.clear(SHUTDOWN_REASON).len();

        let report = ShutdownReport {
            drained,
            stopped,
            cleared,
            elapsed: started.elapsed(),
        };

        internal!(level = INFO, "Delivery pipeline shut down: {report:?}");
        report
    }

    /// Snapshot of pipeline totals and component stats.
    pub fn metrics(&self) -> PipelineMetrics {
        let inner = &self.inner;
        let totals = *inner.totals.lock();
        let uptime = inner.clock.since(inner.created_at);

        let average_queue_time = u32::try_from(totals.succeeded)
            .ok()
            .filter(|succeeded| *succeeded > 0)
            .map_or(Duration::ZERO, |succeeded| {
                totals.queue_time_total / succeeded
            });

        #[allow(clippy::cast_precision_loss)]
        let throughput = if uptime.is_zero() {
            0.0
        } else {
            totals.succeeded as f64 / uptime.as_secs_f64()
        };

        PipelineMetrics {
            state: inner.state(),
            closed: inner.is_closed(),
            pause_reason: inner.pause.lock().reason.clone(),
            accepted: totals.accepted,
            succeeded: totals.succeeded,
            failed: totals.failed,
            cleared: totals.cleared,
            retries: totals.retries,
            rate_limit_signals: totals.rate_limit_signals,
            in_flight: inner.in_flight.load(Ordering::SeqCst),
            average_queue_time,
            max_queue_time: totals.max_queue_time,
            oldest_pending_age: inner
                .queue
                .oldest_created_at()
                .map(|created_at| inner.clock.since(created_at)),
            throughput,
            uptime,
            queue: inner.queue.stats(),
            rate_limiter: inner.rate_limiter.stats(),
            retry: inner.retry_policy.stats(),
            processor: inner.processor.stats(),
            scheduler: inner.scheduler.stats(),
        }
    }

    fn build_message(
        &self,
        sink: Arc<dyn Sink>,
        content: Content,
        options: DeliveryOptions,
        priority: i32,
    ) -> Message {
        let max_retries = options.max_retries.unwrap_or(self.inner.config.max_retries);
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);

        Message::new(sink, content, options, self.inner.clock.now())
            .with_priority(priority)
            .with_max_retries(max_retries)
            .with_sequence(sequence)
    }
}
