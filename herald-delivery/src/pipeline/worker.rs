//! The worker loop: wait for the scheduler, run a batch, act on signals.

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use herald_common::{internal, tracing};
use tokio::{sync::watch, task::JoinSet};

use super::{Inner, PipelineState};
use crate::{
    error::{DeliveryError, RateLimitKind},
    events::DeliveryEvent,
    message::{DeliveryReceipt, Message},
    scheduler::Wakeup,
};

/// Run until the pipeline stops or a newer worker replaces this one.
pub(super) async fn run(inner: Arc<Inner>, epoch: u64) {
    internal!(level = DEBUG, "Delivery worker {epoch} starting");
    let mut state = inner.state.subscribe();

    loop {
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            break;
        }

        let current = *state.borrow_and_update();
        match current {
            PipelineState::Idle | PipelineState::Stopped => break,
            PipelineState::Paused => {
                wait_for_state_change(&mut state).await;
                continue;
            }
            PipelineState::Running => {}
        }

        run_batch(&inner).await;

        if inner.state() != PipelineState::Running {
            continue;
        }

        let now = inner.clock.now();
        inner.queue.promote_due(now);
        let queue_is_empty = inner.queue.ready_len() == 0;
        let ready_in = inner
            .queue
            .next_ready_at()
            .map(|ready_at| ready_at.saturating_duration_since(now));

        if inner.scheduler.wait_next(queue_is_empty, ready_in).await == Wakeup::Stopped {
            tracing::trace!("Scheduler stopped");
        }
    }

    inner.bump_progress();
    internal!(level = DEBUG, "Delivery worker {epoch} stopped");
}

async fn wait_for_state_change(state: &mut watch::Receiver<PipelineState>) {
    // The sender lives in `Inner`, which this worker keeps alive.
    let _ = state.changed().await;
}

/// Process ready messages, up to `max_concurrent_processing` at a time,
/// until none are ready or the loop is no longer running.
async fn run_batch(inner: &Arc<Inner>) {
    if inner
        .processing
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        tracing::debug!("Previous batch still in flight, skipping");
        return;
    }

    inner.queue.promote_due(inner.clock.now());
    let limit = inner.config.max_concurrent_processing.max(1);
    let mut join_set = JoinSet::new();

    loop {
        let room = limit.saturating_sub(join_set.len());
        if room > 0 && inner.state() == PipelineState::Running {
            // Counted before the dequeue so a drain never sees an empty queue
            // with nothing in flight while messages change hands.
            inner.in_flight.fetch_add(room, Ordering::SeqCst);
            let batch = inner.queue.dequeue_batch(room);
            inner.in_flight.fetch_sub(room - batch.len(), Ordering::SeqCst);

            if !batch.is_empty() {
                inner.publish_gauges();
            }
            for message in batch {
                join_set.spawn(process_one(Arc::clone(inner), message));
            }
        }

        let Some(joined) = join_set.join_next().await else {
            break;
        };

        inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Err(error) = joined {
            tracing::error!(%error, "Delivery task terminated abnormally");
        }

        inner.publish_gauges();
        inner.bump_progress();
    }

    inner.processing.store(false, Ordering::Release);
}

/// A non-terminal outcome: the message goes back into the queue.
#[derive(Debug, Clone, Copy)]
enum Signal {
    RateLimited {
        kind: RateLimitKind,
        retry_after: Duration,
    },
    Retry {
        delay: Duration,
    },
}

async fn process_one(inner: Arc<Inner>, mut message: Message) {
    let result = inner.processor.process_message(&mut message).await;
    handle_outcome(&inner, message, result);
}

fn handle_outcome(
    inner: &Arc<Inner>,
    mut message: Message,
    result: Result<DeliveryReceipt, DeliveryError>,
) {
    let id = message.id();

    let signal = match result {
        Ok(receipt) => {
            inner.totals.lock().record_success(receipt.queued_for);
            inner.emit(DeliveryEvent::Sent {
                id,
                attempts: receipt.attempts,
            });
            return;
        }
        Err(DeliveryError::RateLimited { kind, retry_after }) => {
            Signal::RateLimited { kind, retry_after }
        }
        Err(DeliveryError::Retryable { delay, .. }) => Signal::Retry { delay },
        Err(error) => {
            debug_assert!(error.is_terminal(), "unhandled signal {error:?}");
            inner.totals.lock().failed += 1;
            inner.emit(DeliveryEvent::Failed {
                id,
                error: error.to_string(),
            });
            return;
        }
    };

    message.mark_pending();

    // Nothing would ever pick the message up again.
    if inner.is_closed() && !inner.state().is_active() {
        tracing::warn!(message_id = %id, "Dropping signalled message, pipeline is shut down");
        message.mark_failed(DeliveryError::Closed, inner.clock.now());
        inner.totals.lock().failed += 1;
        return;
    }

    match signal {
        Signal::RateLimited { kind, retry_after } => {
            inner.totals.lock().rate_limit_signals += 1;
            inner.emit(DeliveryEvent::RateLimited {
                id,
                kind,
                retry_after,
            });

            match kind {
                RateLimitKind::Proactive => {
                    tracing::debug!(
                        message_id = %id,
                        retry_after_ms = retry_after.as_millis(),
                        "Burst budget exhausted, deferring message"
                    );
                    inner
                        .queue
                        .enqueue_deferred(message, inner.clock.now() + retry_after);
                }
                RateLimitKind::Reactive => {
                    inner.queue.enqueue(message);
                    pause_for_rate_limit(inner, retry_after);
                }
            }
        }
        Signal::Retry { delay } => {
            inner.totals.lock().retries += 1;
            inner.emit(DeliveryEvent::Retrying {
                id,
                retry_count: message.retry_count(),
                delay,
            });
            inner
                .queue
                .enqueue_deferred(message, inner.clock.now() + delay);
        }
    }

    inner.publish_gauges();
}

/// Pause the loop and schedule its resumption after `retry_after`.
fn pause_for_rate_limit(inner: &Arc<Inner>, retry_after: Duration) {
    let reason = format!(
        "Sink rate limit, resuming in {}ms",
        retry_after.as_millis()
    );

    let Some(generation) = inner.pause_automatic(reason) else {
        return;
    };

    let weak = Arc::downgrade(inner);
    let clock = Arc::clone(&inner.clock);

    tokio::spawn(async move {
        clock.sleep(retry_after).await;

        if let Some(inner) = weak.upgrade() {
            inner.resume(Some(generation));
        }
    });
}
