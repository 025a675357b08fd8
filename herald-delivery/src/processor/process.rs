//! Processing of a single message

use std::time::Duration;

use herald_common::{internal, outgoing, tracing};

use crate::{
    error::{DeliveryError, RateLimitKind},
    message::{DeliveryReceipt, Message},
    processor::Processor,
    sink::{SinkError, SinkReceipt},
};

impl Processor {
    /// Deliver `message` once.
    ///
    /// On success the message is completed and its receipt returned. On a
    /// terminal failure the message is failed (settling its handle) and the
    /// error returned. Rate-limit and retryable signals leave the message in
    /// `processing` for the caller to re-enqueue.
    ///
    /// # Errors
    ///
    /// - [`DeliveryError::Validation`] if the message must not be attempted;
    ///   no send is performed
    /// - [`DeliveryError::RateLimited`] if a rate-limit gate refused the send
    ///   or the sink reported its own rate limit
    /// - [`DeliveryError::Retryable`] for a transient failure with retry
    ///   budget left
    /// - [`DeliveryError::Sink`] with the sink's original error otherwise
    pub async fn process_message(
        &self,
        message: &mut Message,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.counters.lock().stats.processed += 1;

        if let Err(error) = message.mark_processing(self.clock.now()) {
            tracing::warn!(message_id = %message.id(), %error, "Message failed validation");
            {
                let mut counters = self.counters.lock();
                counters.stats.validation_failures += 1;
                counters.stats.failed += 1;
            }

            let error = DeliveryError::Validation(error);
            if !message.is_settled() {
                message.mark_failed(error.clone(), self.clock.now());
                record_failure(&error);
            }
            return Err(error);
        }

        if let Err(signal) = self.rate_limiter.check_rate_limit() {
            self.counters.lock().stats.rate_limited += 1;
            if let Some(kind) = signal.rate_limit_kind() {
                record_rate_limited(kind);
            }
            return Err(signal);
        }

        let started = self.clock.now();
        let result = self.send(message).await;
        let latency = self.clock.since(started);
        self.counters.lock().record_send(latency);

        match result {
            Ok(receipt) => Ok(self.complete(message, receipt, latency)),
            Err(error) => Err(self.classify_failure(message, error, latency)),
        }
    }

    async fn send(&self, message: &Message) -> Result<SinkReceipt, SinkError> {
        outgoing!(
            message_id = %message.id(),
            sink = message.sink().name(),
            attempt = message.attempts(),
            "Sending message"
        );

        let send = message.sink().send(message.content(), message.options());

        match self.send_timeout {
            Some(limit) => tokio::time::timeout(limit, send).await.unwrap_or_else(|_| {
                Err(SinkError::Timeout(format!(
                    "no response within {}ms",
                    limit.as_millis()
                )))
            }),
            None => send.await,
        }
    }

    fn complete(
        &self,
        message: &mut Message,
        receipt: SinkReceipt,
        latency: Duration,
    ) -> DeliveryReceipt {
        let delivered = message.mark_completed(receipt, self.clock.now());
        self.counters.lock().stats.succeeded += 1;

        tracing::info!(
            message_id = %message.id(),
            sink = message.sink().name(),
            attempts = delivered.attempts,
            queued_ms = delivered.queued_for.as_millis(),
            "Message delivered"
        );

        if let Some(metrics) = herald_metrics::metrics() {
            metrics.delivery.record_delivery_success(
                latency.as_secs_f64(),
                delivered.queued_for.as_secs_f64(),
                u64::from(delivered.attempts),
            );
        }

        delivered
    }

    fn classify_failure(
        &self,
        message: &mut Message,
        error: SinkError,
        latency: Duration,
    ) -> DeliveryError {
        if error.is_rate_limited() {
            let retry_after = self.rate_limiter.handle_rate_limit(&error);
            self.counters.lock().stats.rate_limited += 1;
            record_rate_limited(RateLimitKind::Reactive);

            return DeliveryError::RateLimited {
                kind: RateLimitKind::Reactive,
                retry_after,
            };
        }

        let retry_count = message.record_failure();
        if self
            .retry_policy
            .should_retry_with_budget(&error, retry_count, message.max_retries())
        {
            let delay = self
                .retry_policy
                .compute_backoff(retry_count.saturating_sub(1));
            self.counters.lock().stats.retryable += 1;

            tracing::warn!(
                message_id = %message.id(),
                retry_count,
                max_retries = message.max_retries(),
                delay_ms = delay.as_millis(),
                %error,
                "Transient delivery failure, will retry"
            );

            if let Some(metrics) = herald_metrics::metrics() {
                metrics.delivery.record_delivery_retry(latency.as_secs_f64());
            }

            return DeliveryError::Retryable {
                delay,
                source: error,
            };
        }

        tracing::error!(
            message_id = %message.id(),
            retry_count,
            %error,
            "Delivery failed permanently"
        );

        let error = DeliveryError::Sink(error);
        message.mark_failed(error.clone(), self.clock.now());
        self.counters.lock().stats.failed += 1;
        record_failure(&error);
        internal!("Message {} settled as failed", message.id());

        error
    }
}

fn record_rate_limited(kind: RateLimitKind) {
    if let Some(metrics) = herald_metrics::metrics() {
        metrics.delivery.record_rate_limited(kind.as_str());
    }
}

fn record_failure(error: &DeliveryError) {
    if let Some(metrics) = herald_metrics::metrics() {
        metrics.delivery.record_delivery_failure(error.reason());
    }
}
