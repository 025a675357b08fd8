//! Delivery pipeline metrics
//!
//! Tracks outbound announcement delivery including:
//! - Messages accepted, delivered, failed, retried and cleared
//! - Rate-limit signals by kind (proactive/reactive)
//! - Send latency and time spent queued
//! - Queue depth by state

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

/// Delivery metrics collector
#[derive(Debug)]
pub struct DeliveryMetrics {
    /// Total number of messages accepted by the pipeline
    messages_accepted: Counter<u64>,

    /// Total number of messages delivered successfully
    messages_delivered: Counter<u64>,

    /// Total number of messages permanently failed, by reason
    messages_failed: Counter<u64>,

    /// Total number of retry re-enqueues
    messages_retrying: Counter<u64>,

    /// Total number of messages rejected by a queue clear
    messages_cleared: Counter<u64>,

    /// Rate-limit signals by kind
    rate_limited: Counter<u64>,

    /// Distribution of sink send latency
    send_duration_seconds: Histogram<f64>,

    /// Distribution of time between admission and successful delivery
    queue_wait_seconds: Histogram<f64>,

    /// Distribution of attempts needed before success
    attempts_per_delivery: Histogram<u64>,

    // Local gauges shared with the observable callback
    queue_ready: Arc<AtomicU64>,
    queue_deferred: Arc<AtomicU64>,
    in_flight: Arc<AtomicU64>,
}

impl Default for DeliveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryMetrics {
    /// Create a new delivery metrics collector against the global meter provider
    #[must_use]
    pub fn new() -> Self {
        let meter = meter();

        let messages_accepted = meter
            .u64_counter("herald.delivery.messages.accepted.total")
            .with_description("Total number of messages accepted by the pipeline")
            .build();

        let messages_delivered = meter
            .u64_counter("herald.delivery.messages.delivered.total")
            .with_description("Total number of messages delivered successfully")
            .build();

        let messages_failed = meter
            .u64_counter("herald.delivery.messages.failed.total")
            .with_description("Total number of messages permanently failed")
            .build();

        let messages_retrying = meter
            .u64_counter("herald.delivery.messages.retrying.total")
            .with_description("Total number of retry re-enqueues")
            .build();

        let messages_cleared = meter
            .u64_counter("herald.delivery.messages.cleared.total")
            .with_description("Total number of messages rejected by a queue clear")
            .build();

        let rate_limited = meter
            .u64_counter("herald.delivery.rate_limited.total")
            .with_description("Rate-limit signals by kind")
            .build();

        let send_duration_seconds = meter
            .f64_histogram("herald.delivery.send.duration.seconds")
            .with_description("Distribution of sink send latency")
            .build();

        let queue_wait_seconds = meter
            .f64_histogram("herald.delivery.queue.wait.seconds")
            .with_description("Time between admission and successful delivery")
            .build();

        let attempts_per_delivery = meter
            .u64_histogram("herald.delivery.attempts")
            .with_description("Distribution of attempts needed before success")
            .build();

        let queue_ready_ref = Arc::new(AtomicU64::new(0));
        let queue_deferred_ref = Arc::new(AtomicU64::new(0));
        let in_flight_ref = Arc::new(AtomicU64::new(0));

        let ready = queue_ready_ref.clone();
        let deferred = queue_deferred_ref.clone();
        let in_flight = in_flight_ref.clone();

        // The meter keeps the callback alive internally
        meter
            .u64_observable_gauge("herald.delivery.queue.size")
            .with_description("Current queue size by state")
            .with_callback(move |observer| {
                observer.observe(
                    ready.load(Ordering::Relaxed),
                    &[KeyValue::new("state", "ready")],
                );
                observer.observe(
                    deferred.load(Ordering::Relaxed),
                    &[KeyValue::new("state", "deferred")],
                );
                observer.observe(
                    in_flight.load(Ordering::Relaxed),
                    &[KeyValue::new("state", "in_flight")],
                );
            })
            .build();

        Self {
            messages_accepted,
            messages_delivered,
            messages_failed,
            messages_retrying,
            messages_cleared,
            rate_limited,
            send_duration_seconds,
            queue_wait_seconds,
            attempts_per_delivery,
            queue_ready: queue_ready_ref,
            queue_deferred: queue_deferred_ref,
            in_flight: in_flight_ref,
        }
    }

    /// Record a message admitted through `enqueue` or `send_immediate`
    pub fn record_accepted(&self, immediate: bool) {
        self.messages_accepted
            .add(1, &[KeyValue::new("immediate", immediate)]);
    }

    /// Record a successful delivery
    pub fn record_delivery_success(&self, send_secs: f64, queued_secs: f64, attempts: u64) {
        self.send_duration_seconds
            .record(send_secs, &[KeyValue::new("outcome", "success")]);
        self.queue_wait_seconds.record(queued_secs, &[]);
        self.attempts_per_delivery.record(attempts, &[]);
        self.messages_delivered.add(1, &[]);
    }

    /// Record a terminal failure
    pub fn record_delivery_failure(&self, reason: &'static str) {
        self.messages_failed
            .add(1, &[KeyValue::new("reason", reason)]);
    }

    /// Record a failed send attempt that is going to be retried
    pub fn record_delivery_retry(&self, send_secs: f64) {
        self.send_duration_seconds
            .record(send_secs, &[KeyValue::new("outcome", "retry")]);
        self.messages_retrying.add(1, &[]);
    }

    /// Record a rate-limit signal of the given kind (`proactive` or `reactive`)
    pub fn record_rate_limited(&self, kind: &'static str) {
        self.rate_limited.add(1, &[KeyValue::new("kind", kind)]);
    }

    /// Record messages rejected by a queue clear
    pub fn record_cleared(&self, count: u64) {
        self.messages_cleared.add(count, &[]);
    }

    /// Set the absolute queue depth
    pub fn set_queue_size(&self, ready: u64, deferred: u64) {
        self.queue_ready.store(ready, Ordering::Relaxed);
        self.queue_deferred.store(deferred, Ordering::Relaxed);
    }

    /// Set the number of messages currently being processed
    pub fn set_in_flight(&self, count: u64) {
        self.in_flight.store(count, Ordering::Relaxed);
    }

    /// Current `(ready, deferred, in_flight)` gauge values
    #[must_use]
    pub fn queue_size(&self) -> (u64, u64, u64) {
        (
            self.queue_ready.load(Ordering::Relaxed),
            self.queue_deferred.load(Ordering::Relaxed),
            self.in_flight.load(Ordering::Relaxed),
        )
    }
}

/// Get the OpenTelemetry meter for delivery metrics
fn meter() -> Meter {
    opentelemetry::global::meter("herald.delivery")
}
