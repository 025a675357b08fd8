//! Integration tests for the delivery pipeline
//!
//! Pipelines run in test mode on a `ManualClock`: ready work is processed on
//! the next task tick and deferred work only once the test advances time.
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{sync::Arc, time::Duration};

use herald_delivery::{
    DeliveryError, DeliveryEvent, DeliveryHandle, DeliveryOptions, DeliveryPipeline,
    DeliveryReceipt, Headers, ManualClock, PipelineConfig, PipelineError, PipelineState,
    RateLimitKind, SinkError,
};
use support::mock_sink::MockSink;
use tokio::sync::broadcast;

type Completion = Result<DeliveryReceipt, DeliveryError>;

fn test_config() -> PipelineConfig {
    PipelineConfig {
        test_mode: true,
        burst_allowance: 100,
        ..PipelineConfig::default()
    }
}

fn pipeline(config: PipelineConfig) -> (DeliveryPipeline, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let pipeline = DeliveryPipeline::builder()
        .with_config(config)
        .with_clock(clock.clone())
        .build()
        .expect("valid configuration");
    (pipeline, clock)
}

/// Let every runnable task make progress.
async fn settle_tasks() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

async fn settle(handle: DeliveryHandle) -> Completion {
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("message settled in time")
}

/// Advance `clock` by `step` until `handle` settles.
async fn advance_until_settled(
    clock: &ManualClock,
    handle: &mut DeliveryHandle,
    step: Duration,
    max_steps: usize,
) -> Completion {
    for _ in 0..max_steps {
        settle_tasks().await;
        if let Some(result) = handle.try_result() {
            return result;
        }
        clock.advance(step);
    }

    settle_tasks().await;
    handle.try_result().expect("message settled")
}

fn drain_events(receiver: &mut broadcast::Receiver<DeliveryEvent>) -> Vec<DeliveryEvent> {
    std::iter::from_fn(|| receiver.try_recv().ok()).collect()
}

#[tokio::test]
async fn test_priority_order() {
    let (pipeline, _clock) = pipeline(PipelineConfig {
        auto_start: false,
        ..test_config()
    });
    let sink = MockSink::succeeding();

    let handles = [(1, "first low"), (5, "high"), (1, "second low")].map(|(priority, body)| {
        pipeline.enqueue(
            sink.clone(),
            body,
            DeliveryOptions::default().with_priority(priority),
        )
    });

    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert_eq!(pipeline.queue_len(), 3);

    pipeline.start().unwrap();
    for handle in handles {
        settle(handle).await.unwrap();
    }

    assert_eq!(sink.delivered(), ["high", "first low", "second low"]);
}

#[tokio::test]
async fn test_enqueue_auto_starts() {
    let (pipeline, _clock) = pipeline(test_config());
    let sink = MockSink::succeeding();
    let mut events = pipeline.subscribe();

    let handle = pipeline.enqueue(sink.clone(), "hello", DeliveryOptions::default());
    let id = handle.id();
    assert_eq!(pipeline.state(), PipelineState::Running);

    let receipt = settle(handle).await.unwrap();
    assert_eq!(receipt.message_id, id);
    assert_eq!(receipt.attempts, 1);
    assert_eq!(receipt.sink.remote_id.as_deref(), Some("remote-1"));

    assert_eq!(
        drain_events(&mut events),
        [
            DeliveryEvent::Queued { id, priority: 0 },
            DeliveryEvent::Sent { id, attempts: 1 },
        ]
    );

    let metrics = pipeline.metrics();
    assert_eq!(metrics.accepted, 1);
    assert_eq!(metrics.succeeded, 1);
    assert_eq!(metrics.success_rate(), Some(1.0));
}

#[tokio::test]
async fn test_burst_limit_defers_excess() {
    let (pipeline, clock) = pipeline(PipelineConfig {
        burst_allowance: 2,
        base_send_delay_ms: 1000,
        burst_reset_time_ms: 5000,
        ..test_config()
    });
    let sink = MockSink::succeeding();

    let first = pipeline.enqueue(sink.clone(), "one", DeliveryOptions::default());
    let second = pipeline.enqueue(sink.clone(), "two", DeliveryOptions::default());
    let mut third = pipeline.enqueue(sink.clone(), "three", DeliveryOptions::default());

    settle(first).await.unwrap();
    settle(second).await.unwrap();

    settle_tasks().await;
    assert!(third.try_result().is_none(), "third send must wait for the window");
    assert_eq!(sink.calls(), 2);

    let result =
        advance_until_settled(&clock, &mut third, Duration::from_secs(1), 10).await;
    result.unwrap();

    assert!(clock.elapsed() > Duration::from_secs(5));
    assert_eq!(sink.delivered(), ["one", "two", "three"]);

    let metrics = pipeline.metrics();
    assert!(metrics.rate_limit_signals >= 1);
    assert!(metrics.rate_limiter.burst_hits >= 1);
}

#[tokio::test]
async fn test_reactive_rate_limit_pauses_pipeline() {
    let (pipeline, clock) = pipeline(test_config());
    let sink = MockSink::builder()
        .then_fail(SinkError::rate_limited(Some(Duration::from_secs(2))))
        .build();
    let mut events = pipeline.subscribe();

    let mut handle = pipeline.enqueue(sink.clone(), "announcement", DeliveryOptions::default());
    let id = handle.id();
    settle_tasks().await;

    assert_eq!(pipeline.state(), PipelineState::Paused);
    assert!(pipeline.rate_limiter().is_paused());
    assert_eq!(
        pipeline.rate_limiter().pause_remaining(),
        Duration::from_millis(2500)
    );
    assert!(pipeline.metrics().pause_reason.is_some());

    clock.advance(Duration::from_millis(2499));
    settle_tasks().await;
    assert!(handle.try_result().is_none());
    assert_eq!(sink.calls(), 1);

    let receipt = advance_until_settled(&clock, &mut handle, Duration::from_millis(1), 10)
        .await
        .unwrap();

    assert_eq!(receipt.attempts, 2);
    assert_eq!(clock.elapsed(), Duration::from_millis(2500));
    assert_eq!(pipeline.state(), PipelineState::Running);
    assert!(!pipeline.rate_limiter().is_paused());

    let events = drain_events(&mut events);
    assert_eq!(
        events,
        [
            DeliveryEvent::Queued { id, priority: 0 },
            DeliveryEvent::RateLimited {
                id,
                kind: RateLimitKind::Reactive,
                retry_after: Duration::from_millis(2500),
            },
            DeliveryEvent::Paused {
                reason: "Sink rate limit, resuming in 2500ms".to_string(),
            },
            DeliveryEvent::Resumed,
            DeliveryEvent::Sent { id, attempts: 2 },
        ]
    );
}

#[tokio::test]
async fn test_oversized_retry_after_is_capped() {
    let (pipeline, clock) = pipeline(PipelineConfig {
        max_rate_limit_pause_ms: 5000,
        ..test_config()
    });
    let mut headers = Headers::default();
    headers.insert("retry-after".to_string(), "1e20".to_string());
    let sink = MockSink::builder()
        .then_fail(SinkError::Http {
            status: 429,
            message: "Too Many Requests".to_string(),
            headers,
        })
        .build();

    let mut handle = pipeline.enqueue(sink.clone(), "announcement", DeliveryOptions::default());
    settle_tasks().await;

    assert!(handle.try_result().is_none());
    assert_eq!(pipeline.state(), PipelineState::Paused);
    assert!(pipeline.rate_limiter().is_paused());
    assert_eq!(
        pipeline.rate_limiter().pause_remaining(),
        Duration::from_secs(5)
    );
    assert_eq!(pipeline.metrics().rate_limit_signals, 1);

    let receipt = advance_until_settled(&clock, &mut handle, Duration::from_secs(1), 10)
        .await
        .unwrap();

    assert_eq!(receipt.attempts, 2);
    assert_eq!(clock.elapsed(), Duration::from_secs(5));
    assert_eq!(pipeline.metrics().failed, 0);
    assert_eq!(sink.delivered(), ["announcement"]);
}

#[tokio::test]
async fn test_manual_pause_wins_over_rate_limit_resume() {
    let (pipeline, clock) = pipeline(test_config());
    let sink = MockSink::builder()
        .then_fail(SinkError::http(429, "Too Many Requests"))
        .build();

    let mut handle = pipeline.enqueue(sink.clone(), "announcement", DeliveryOptions::default());
    settle_tasks().await;
    assert_eq!(pipeline.state(), PipelineState::Paused);

    assert!(pipeline.pause("maintenance"));
    clock.advance(Duration::from_secs(5));
    settle_tasks().await;

    assert_eq!(pipeline.state(), PipelineState::Paused);
    assert!(handle.try_result().is_none());

    assert!(pipeline.resume());
    settle(handle).await.unwrap();
}

#[tokio::test]
async fn test_retry_exhaustion_fails_with_original_error() {
    let (pipeline, clock) = pipeline(PipelineConfig {
        max_retries: 3,
        ..test_config()
    });
    let failure = SinkError::Network("connection refused".to_string());
    let sink = MockSink::failing(failure.clone());

    let mut handle = pipeline.enqueue(sink.clone(), "doomed", DeliveryOptions::default());
    let error = advance_until_settled(&clock, &mut handle, Duration::from_secs(1), 20)
        .await
        .unwrap_err();

    assert_eq!(error, DeliveryError::Sink(failure));
    assert_eq!(sink.calls(), 3);

    clock.advance(Duration::from_secs(60));
    settle_tasks().await;
    assert_eq!(sink.calls(), 3, "no attempt after the terminal failure");

    let metrics = pipeline.metrics();
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.failed, 1);
    assert_eq!(pipeline.queue_len(), 0);
}

#[tokio::test]
async fn test_message_retry_budget_override() {
    let (pipeline, clock) = pipeline(test_config());
    let sink = MockSink::failing(SinkError::http(503, "Service Unavailable"));

    let mut handle = pipeline.enqueue(
        sink.clone(),
        "once",
        DeliveryOptions::default().with_max_retries(1),
    );
    let error = advance_until_settled(&clock, &mut handle, Duration::from_secs(1), 5)
        .await
        .unwrap_err();

    assert!(matches!(error, DeliveryError::Sink(SinkError::Http { status: 503, .. })));
    assert_eq!(sink.calls(), 1);
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let (pipeline, clock) = pipeline(test_config());
    let sink = MockSink::builder()
        .then_fail(SinkError::Timeout("gateway".to_string()))
        .build();

    let mut handle = pipeline.enqueue(sink.clone(), "eventually", DeliveryOptions::default());
    settle_tasks().await;
    assert_eq!(pipeline.queue_len(), 1, "retry waits in the deferred area");

    let receipt = advance_until_settled(&clock, &mut handle, Duration::from_millis(250), 10)
        .await
        .unwrap();

    assert_eq!(receipt.attempts, 2);
    assert_eq!(clock.elapsed(), Duration::from_secs(1));
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let (pipeline, _clock) = pipeline(test_config());
    let sink = MockSink::failing(SinkError::Rejected("unknown channel".to_string()));

    let handle = pipeline.enqueue(sink.clone(), "lost", DeliveryOptions::default());
    let error = settle(handle).await.unwrap_err();

    assert_eq!(
        error,
        DeliveryError::Sink(SinkError::Rejected("unknown channel".to_string()))
    );
    assert_eq!(sink.calls(), 1);
}

#[tokio::test]
async fn test_empty_content_fails_validation() {
    let (pipeline, _clock) = pipeline(test_config());
    let sink = MockSink::succeeding();

    let handle = pipeline.enqueue(sink.clone(), "", DeliveryOptions::default());
    let error = settle(handle).await.unwrap_err();

    assert!(matches!(error, DeliveryError::Validation(_)));
    assert_eq!(sink.calls(), 0);
}

#[tokio::test]
async fn test_clear_rejects_pending() {
    let (pipeline, _clock) = pipeline(PipelineConfig {
        auto_start: false,
        ..test_config()
    });
    let sink = MockSink::succeeding();
    let mut events = pipeline.subscribe();

    let handle = pipeline.enqueue(sink.clone(), "never", DeliveryOptions::default());
    let id = handle.id();

    let cleared = pipeline.clear("shutdown");
    assert_eq!(cleared, [id]);
    assert_eq!(pipeline.queue_len(), 0);

    let error = settle(handle).await.unwrap_err();
    assert_eq!(error.to_string(), "shutdown");
    assert_eq!(sink.calls(), 0);

    let events = drain_events(&mut events);
    assert_eq!(
        events.last(),
        Some(&DeliveryEvent::Cleared {
            count: 1,
            reason: "shutdown".to_string(),
        })
    );
    assert_eq!(pipeline.metrics().cleared, 1);
}

#[tokio::test]
async fn test_shutdown_drains_queue() {
    let (pipeline, _clock) = pipeline(test_config());
    let sink = MockSink::succeeding();

    let handles: Vec<_> = (0..10)
        .map(|n| pipeline.enqueue(sink.clone(), format!("message {n}"), DeliveryOptions::default()))
        .collect();

    let report = pipeline.shutdown(Duration::from_secs(10)).await;

    assert!(report.drained);
    assert!(report.stopped);
    assert_eq!(report.cleared, 0);
    assert_eq!(pipeline.queue_len(), 0);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert!(pipeline.is_closed());

    for handle in handles {
        settle(handle).await.unwrap();
    }
    assert_eq!(sink.calls(), 10);
}

#[tokio::test]
async fn test_shutdown_starts_idle_pipeline() {
    let (pipeline, _clock) = pipeline(PipelineConfig {
        auto_start: false,
        ..test_config()
    });
    let sink = MockSink::succeeding();

    let handle = pipeline.enqueue(sink.clone(), "queued", DeliveryOptions::default());
    let report = pipeline.shutdown(Duration::from_secs(10)).await;

    assert!(report.drained);
    settle(handle).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_timeout_clears_remainder() {
    let (pipeline, _clock) = pipeline(PipelineConfig {
        burst_allowance: 1,
        ..test_config()
    });
    let sink = MockSink::succeeding();

    let first = pipeline.enqueue(sink.clone(), "sent", DeliveryOptions::default());
    let second = pipeline.enqueue(sink.clone(), "stuck", DeliveryOptions::default());

    // The virtual clock never moves, so the burst window never resets.
    let report = pipeline.shutdown(Duration::from_millis(200)).await;

    assert!(!report.drained);
    assert_eq!(report.cleared, 1);
    settle(first).await.unwrap();
    assert_eq!(
        settle(second).await.unwrap_err(),
        DeliveryError::Cleared {
            reason: "shutdown".to_string()
        }
    );
}

#[tokio::test]
async fn test_closed_pipeline_refuses_work() {
    let (pipeline, _clock) = pipeline(test_config());
    let sink = MockSink::succeeding();

    pipeline.shutdown(Duration::from_secs(1)).await;

    let handle = pipeline.enqueue(sink.clone(), "late", DeliveryOptions::default());
    assert_eq!(settle(handle).await.unwrap_err(), DeliveryError::Closed);

    let immediate = pipeline
        .send_immediate(sink.clone(), "late", DeliveryOptions::default())
        .await;
    assert_eq!(immediate.unwrap_err(), DeliveryError::Closed);

    assert!(matches!(pipeline.start(), Err(PipelineError::Closed)));
    assert_eq!(sink.calls(), 0);
}

#[tokio::test]
async fn test_send_immediate_bypasses_queue() {
    let (pipeline, _clock) = pipeline(PipelineConfig {
        auto_start: false,
        ..test_config()
    });
    let sink = MockSink::succeeding();

    let queued = pipeline.enqueue(sink.clone(), "queued", DeliveryOptions::default());
    let receipt = pipeline
        .send_immediate(sink.clone(), "urgent", DeliveryOptions::default())
        .await
        .unwrap();

    assert_eq!(receipt.attempts, 1);
    assert_eq!(sink.delivered(), ["urgent"]);
    assert_eq!(pipeline.queue_len(), 1);

    pipeline.start().unwrap();
    settle(queued).await.unwrap();
    assert_eq!(sink.delivered(), ["urgent", "queued"]);
}

#[tokio::test]
async fn test_send_immediate_surfaces_signals() {
    let (pipeline, _clock) = pipeline(test_config());
    let sink = MockSink::builder()
        .then_fail(SinkError::rate_limited(Some(Duration::from_secs(1))))
        .build();

    let error = pipeline
        .send_immediate(sink.clone(), "urgent", DeliveryOptions::default())
        .await
        .unwrap_err();

    assert_eq!(
        error,
        DeliveryError::RateLimited {
            kind: RateLimitKind::Reactive,
            retry_after: Duration::from_millis(1500),
        }
    );
    assert_eq!(pipeline.metrics().rate_limit_signals, 1);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let (pipeline, _clock) = pipeline(test_config());
    let sink = MockSink::succeeding();

    pipeline.start().unwrap();
    assert!(pipeline.pause("maintenance"));
    assert_eq!(pipeline.state(), PipelineState::Paused);

    let mut handle = pipeline.enqueue(sink.clone(), "held", DeliveryOptions::default());
    settle_tasks().await;
    assert!(handle.try_result().is_none());
    assert_eq!(sink.calls(), 0);
    assert_eq!(
        pipeline.metrics().pause_reason.as_deref(),
        Some("maintenance")
    );

    assert!(pipeline.resume());
    assert!(!pipeline.resume());
    settle(handle).await.unwrap();
}

#[tokio::test]
async fn test_stop_and_restart() {
    let (pipeline, _clock) = pipeline(test_config());
    let sink = MockSink::succeeding();

    pipeline.start().unwrap();
    pipeline.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    let handle = pipeline.enqueue(sink.clone(), "after stop", DeliveryOptions::default());
    settle_tasks().await;
    assert_eq!(pipeline.state(), PipelineState::Stopped, "auto-start only from idle");
    assert_eq!(sink.calls(), 0);

    pipeline.start().unwrap();
    settle(handle).await.unwrap();
}

#[tokio::test]
async fn test_stop_when_idle_is_noop() {
    let (pipeline, _clock) = pipeline(test_config());

    pipeline.stop(Duration::from_millis(10)).await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_bounded() {
    let (pipeline, _clock) = pipeline(PipelineConfig {
        max_concurrent_processing: 3,
        ..test_config()
    });
    let sink = MockSink::builder()
        .with_latency(Duration::from_millis(100))
        .build();

    let handles: Vec<_> = (0..9)
        .map(|n| pipeline.enqueue(sink.clone(), format!("message {n}"), DeliveryOptions::default()))
        .collect();

    for handle in handles {
        settle(handle).await.unwrap();
    }

    assert_eq!(sink.calls(), 9);
    assert_eq!(sink.max_in_flight(), 3);
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
    let result = DeliveryPipeline::new(PipelineConfig {
        burst_reset_time_ms: 0,
        ..PipelineConfig::default()
    });

    assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
}

#[test]
fn test_start_outside_runtime() {
    let pipeline = DeliveryPipeline::new(test_config()).unwrap();
    assert!(matches!(pipeline.start(), Err(PipelineError::NoRuntime)));
}

#[tokio::test]
async fn test_queue_time_is_measured_on_the_pipeline_clock() {
    let (pipeline, clock) = pipeline(PipelineConfig {
        auto_start: false,
        ..test_config()
    });
    let sink = MockSink::succeeding();

    assert_eq!(pipeline.metrics().oldest_pending_age, None);

    let handle = pipeline.enqueue(sink.clone(), "waited", DeliveryOptions::default());
    clock.advance(Duration::from_secs(3));
    assert_eq!(
        pipeline.metrics().oldest_pending_age,
        Some(Duration::from_secs(3))
    );
    pipeline.start().unwrap();

    let receipt = settle(handle).await.unwrap();
    assert_eq!(receipt.queued_for, Duration::from_secs(3));

    let metrics = pipeline.metrics();
    assert_eq!(metrics.max_queue_time, Duration::from_secs(3));
    assert_eq!(metrics.average_queue_time, Duration::from_secs(3));
    assert_eq!(metrics.uptime, Duration::from_secs(3));
    assert_eq!(metrics.oldest_pending_age, None);
}
