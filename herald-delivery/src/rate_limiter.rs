//! Dual-mode rate limiting for a single sink
//!
//! Two gates guard every send:
//!
//! - **Reactive cooldown**: after the sink reports a rate limit the limiter
//!   pauses until the sink's own retry-after hint (plus a safety buffer) has
//!   elapsed.
//! - **Proactive burst budget**: at most `burst_allowance` sends per
//!   `burst_reset_time` window, so the sink's limit is rarely hit at all.
//!
//! The reactive gate is checked first; a paused limiter consumes no budget.
//!
//! ```text
//! burst_allowance: 2, burst_reset_time: 5s
//! - t=0.0s check -> ok        (1/2)
//! - t=0.1s check -> ok        (2/2)
//! - t=0.2s check -> proactive (retry after base_send_delay)
//! - t=5.1s check -> ok        (window reset, 1/2)
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use herald_common::tracing;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    clock::Clock,
    config::PipelineConfig,
    error::{DeliveryError, RateLimitKind},
    sink::{Headers, SinkError},
};

/// Header names carrying a retry-after hint, in order of preference.
const RETRY_AFTER_HEADERS: [&str; 1] = ["retry-after"];
const RESET_AFTER_HEADERS: [&str; 2] = ["reset-after", "x-ratelimit-reset-after"];

/// Limits applied by a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub burst_allowance: u32,
    pub burst_window: Duration,
    /// Reported as `retry_after` when the burst budget is exhausted.
    pub base_send_delay: Duration,
    /// Pause used when the sink gives no hint at all.
    pub default_retry_after: Duration,
    /// Added to every sink-reported hint.
    pub buffer: Duration,
    /// Longest pause the limiter will impose, whatever the sink asks for.
    pub max_pause: Duration,
}

impl From<&PipelineConfig> for RateLimitConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            burst_allowance: config.burst_allowance,
            burst_window: config.burst_reset_time(),
            base_send_delay: config.base_send_delay(),
            default_retry_after: config.default_retry_after(),
            buffer: config.rate_limit_buffer(),
            max_pause: config.max_rate_limit_pause(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

#[derive(Debug)]
struct Pause {
    until: Instant,
    reason: String,
}

#[derive(Debug)]
struct State {
    burst_count: u32,
    window_start: Instant,
    pause: Option<Pause>,
    burst_hits: u64,
    reactive_hits: u64,
    delay_count: u64,
    delay_total: Duration,
    delay_max: Duration,
    last_hit_at: Option<Instant>,
}

impl State {
    fn record_delay(&mut self, delay: Duration, now: Instant) {
        self.delay_count += 1;
        self.delay_total = self.delay_total.saturating_add(delay);
        self.delay_max = self.delay_max.max(delay);
        self.last_hit_at = Some(now);
    }

    /// Drop an expired pause; returns the time left on a live one.
    fn pause_remaining(&mut self, now: Instant) -> Option<Duration> {
        let until = self.pause.as_ref()?.until;
        if now < until {
            return Some(until - now);
        }

        if let Some(pause) = self.pause.take() {
            tracing::debug!(reason = %pause.reason, "Rate limit pause expired");
        }
        None
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    /// Sends counted in the current window
    pub burst_count: u32,
    pub burst_allowance: u32,
    /// Refusals by the proactive burst budget
    pub burst_hits: u64,
    /// Sink-reported rate limits plus refusals during a cooldown
    pub reactive_hits: u64,
    pub is_paused: bool,
    pub pause_reason: Option<String>,
    pub pause_remaining: Duration,
    /// Number of delays imposed
    pub delay_count: u64,
    pub average_delay: Duration,
    pub max_delay: Duration,
    /// Time since the most recent rate-limit hit
    pub since_last_hit: Option<Duration>,
}

/// Gatekeeper deciding whether a send may proceed right now.
///
/// Counters and the pause live behind one mutex, so a check and the budget
/// increment it implies are a single critical section.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let state = State {
            burst_count: 0,
            window_start: clock.now(),
            pause: None,
            burst_hits: 0,
            reactive_hits: 0,
            delay_count: 0,
            delay_total: Duration::ZERO,
            delay_max: Duration::ZERO,
            last_hit_at: None,
        };

        Self {
            config,
            clock,
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check both gates and, if they pass, consume one unit of burst budget.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::RateLimited`] naming the gate that refused
    /// and how long to wait before trying again.
    pub fn check_rate_limit(&self) -> Result<(), DeliveryError> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if let Some(retry_after) = state.pause_remaining(now) {
            state.reactive_hits += 1;
            drop(state);

            tracing::debug!(
                retry_after_ms = retry_after.as_millis(),
                "Send refused, sink cooldown in effect"
            );
            return Err(DeliveryError::RateLimited {
                kind: RateLimitKind::Reactive,
                retry_after,
            });
        }

        if now.saturating_duration_since(state.window_start) > self.config.burst_window {
            state.burst_count = 0;
            state.window_start = now;
        }

        if state.burst_count >= self.config.burst_allowance {
            let retry_after = self.config.base_send_delay;
            state.burst_hits += 1;
            state.record_delay(retry_after, now);
            drop(state);

            tracing::debug!(
                burst_allowance = self.config.burst_allowance,
                retry_after_ms = retry_after.as_millis(),
                "Send refused, burst budget exhausted"
            );
            return Err(DeliveryError::RateLimited {
                kind: RateLimitKind::Proactive,
                retry_after,
            });
        }

        state.burst_count += 1;
        Ok(())
    }

    /// React to a rate limit reported by the sink: pause for the sink's hint
    /// plus the safety buffer.
    ///
    /// Returns the pause that was applied, capped at `max_pause`.
    pub fn handle_rate_limit(&self, error: &SinkError) -> Duration {
        let retry_after = self
            .retry_after_hint(error)
            .saturating_add(self.config.buffer)
            .min(self.config.max_pause);

        {
            let mut state = self.state.lock();
            state.reactive_hits += 1;
        }

        self.set_pause(retry_after, error.to_string());
        retry_after
    }

    /// Refuse every send for `duration` (at most `max_pause`), replacing any
    /// current pause.
    pub fn set_pause(&self, duration: Duration, reason: impl Into<String>) {
        let now = self.clock.now();
        let reason = reason.into();
        let duration = duration.min(self.config.max_pause);

        let Some(until) = now.checked_add(duration) else {
            tracing::error!(
                pause_ms = duration.as_millis(),
                reason = %reason,
                "Rate limit pause is not representable, keeping the current pause"
            );
            return;
        };

        tracing::warn!(
            pause_ms = duration.as_millis(),
            reason = %reason,
            "Pausing sends after sink rate limit"
        );

        let mut state = self.state.lock();
        state.record_delay(duration, now);
        state.pause = Some(Pause { until, reason });
    }

    pub fn is_paused(&self) -> bool {
        let now = self.clock.now();
        self.state.lock().pause_remaining(now).is_some()
    }

    /// Time left on the current pause, zero when not paused.
    pub fn pause_remaining(&self) -> Duration {
        let now = self.clock.now();
        self.state
            .lock()
            .pause_remaining(now)
            .unwrap_or(Duration::ZERO)
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let pause_remaining = state.pause_remaining(now);

        let average_delay = u32::try_from(state.delay_count)
            .ok()
            .filter(|count| *count > 0)
            .map_or(Duration::ZERO, |count| state.delay_total / count);

        RateLimiterStats {
            burst_count: state.burst_count,
            burst_allowance: self.config.burst_allowance,
            burst_hits: state.burst_hits,
            reactive_hits: state.reactive_hits,
            is_paused: pause_remaining.is_some(),
            pause_reason: state.pause.as_ref().map(|pause| pause.reason.clone()),
            pause_remaining: pause_remaining.unwrap_or(Duration::ZERO),
            delay_count: state.delay_count,
            average_delay,
            max_delay: state.delay_max,
            since_last_hit: state
                .last_hit_at
                .map(|hit| now.saturating_duration_since(hit)),
        }
    }

    /// Pick the sink's retry-after hint: explicit field, alternate field,
    /// `retry-after` header, reset headers, then the configured default.
    fn retry_after_hint(&self, error: &SinkError) -> Duration {
        if let SinkError::RateLimited {
            retry_after,
            reset_after,
            ..
        } = error
            && let Some(hint) = retry_after.or(*reset_after)
        {
            return hint;
        }

        error
            .headers()
            .and_then(|headers| {
                header_seconds(headers, &RETRY_AFTER_HEADERS)
                    .or_else(|| header_seconds(headers, &RESET_AFTER_HEADERS))
            })
            .unwrap_or(self.config.default_retry_after)
    }
}

/// First header among `names` (case-insensitive) holding a non-negative
/// number of seconds.
fn header_seconds(headers: &Headers, names: &[&str]) -> Option<Duration> {
    names.iter().find_map(|name| {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| value.trim().parse::<f64>().ok())
            .filter(|seconds| *seconds >= 0.0)
            .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(burst_allowance: u32) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = RateLimitConfig {
            burst_allowance,
            burst_window: Duration::from_secs(5),
            base_send_delay: Duration::from_secs(1),
            default_retry_after: Duration::from_secs(1),
            buffer: Duration::from_millis(500),
            max_pause: Duration::from_secs(60),
        };
        (RateLimiter::new(config, clock.clone()), clock)
    }

    fn retry_after_of(result: Result<(), DeliveryError>) -> (RateLimitKind, Duration) {
        match result.unwrap_err() {
            DeliveryError::RateLimited { kind, retry_after } => (kind, retry_after),
            other => panic!("expected a rate limit, got {other:?}"),
        }
    }

    #[test]
    fn burst_budget_refuses_then_resets() {
        let (limiter, clock) = limiter(2);

        assert!(limiter.check_rate_limit().is_ok());
        assert!(limiter.check_rate_limit().is_ok());

        let (kind, retry_after) = retry_after_of(limiter.check_rate_limit());
        assert_eq!(kind, RateLimitKind::Proactive);
        assert_eq!(retry_after, Duration::from_secs(1));

        clock.advance(Duration::from_millis(5001));
        assert!(limiter.check_rate_limit().is_ok());

        let stats = limiter.stats();
        assert_eq!(stats.burst_hits, 1);
        assert_eq!(stats.burst_count, 1);
    }

    #[test]
    fn window_boundary_is_exclusive() {
        let (limiter, clock) = limiter(1);

        assert!(limiter.check_rate_limit().is_ok());
        clock.advance(Duration::from_secs(5));
        assert!(limiter.check_rate_limit().is_err());
    }

    #[test]
    fn reactive_pause_adds_buffer() {
        let (limiter, clock) = limiter(10);

        let applied = limiter.handle_rate_limit(&SinkError::rate_limited(Some(
            Duration::from_secs(2),
        )));
        assert_eq!(applied, Duration::from_millis(2500));
        assert!(limiter.is_paused());

        let (kind, retry_after) = retry_after_of(limiter.check_rate_limit());
        assert_eq!(kind, RateLimitKind::Reactive);
        assert_eq!(retry_after, Duration::from_millis(2500));

        clock.advance(Duration::from_millis(2500));
        assert!(limiter.check_rate_limit().is_ok());
        assert!(!limiter.is_paused());
    }

    #[test]
    fn paused_limiter_consumes_no_budget() {
        let (limiter, clock) = limiter(1);

        limiter.set_pause(Duration::from_secs(1), "test");
        assert!(limiter.check_rate_limit().is_err());
        assert!(limiter.check_rate_limit().is_err());
        assert_eq!(limiter.stats().burst_count, 0);

        clock.advance(Duration::from_secs(1));
        assert!(limiter.check_rate_limit().is_ok());
    }

    #[test]
    fn reset_after_field_used_when_retry_after_missing() {
        let (limiter, _clock) = limiter(1);
        let error = SinkError::RateLimited {
            retry_after: None,
            reset_after: Some(Duration::from_secs(3)),
            headers: Headers::default(),
        };

        assert_eq!(limiter.handle_rate_limit(&error), Duration::from_millis(3500));
    }

    #[test]
    fn headers_are_consulted_in_order() {
        let (limiter, _clock) = limiter(1);

        let mut headers = Headers::default();
        headers.insert("X-RateLimit-Reset-After".to_string(), "4".to_string());
        let error = SinkError::Http {
            status: 429,
            message: "Too Many Requests".to_string(),
            headers: headers.clone(),
        };
        assert_eq!(limiter.handle_rate_limit(&error), Duration::from_millis(4500));

        headers.insert("Retry-After".to_string(), "1.5".to_string());
        let error = SinkError::RateLimited {
            retry_after: None,
            reset_after: None,
            headers,
        };
        assert_eq!(limiter.handle_rate_limit(&error), Duration::from_millis(2000));
    }

    #[test]
    fn missing_hint_uses_default() {
        let (limiter, _clock) = limiter(1);

        let mut headers = Headers::default();
        headers.insert("retry-after".to_string(), "soon".to_string());
        let error = SinkError::Http {
            status: 429,
            message: String::new(),
            headers,
        };

        assert_eq!(limiter.handle_rate_limit(&error), Duration::from_millis(1500));
    }

    #[test]
    fn oversized_header_hint_is_capped() {
        let (limiter, _clock) = limiter(1);

        let mut headers = Headers::default();
        headers.insert("retry-after".to_string(), "1e20".to_string());
        let error = SinkError::Http {
            status: 429,
            message: "Too Many Requests".to_string(),
            headers,
        };

        assert_eq!(limiter.handle_rate_limit(&error), Duration::from_secs(60));
        assert!(limiter.is_paused());
        assert_eq!(limiter.pause_remaining(), Duration::from_secs(60));
    }

    #[test]
    fn unrepresentable_header_falls_back_to_next_hint() {
        let (limiter, _clock) = limiter(1);

        let mut headers = Headers::default();
        headers.insert("retry-after".to_string(), "inf".to_string());
        headers.insert("reset-after".to_string(), "2".to_string());
        let error = SinkError::Http {
            status: 429,
            message: String::new(),
            headers,
        };

        assert_eq!(limiter.handle_rate_limit(&error), Duration::from_millis(2500));
    }

    #[test]
    fn maximal_explicit_hint_does_not_overflow() {
        let (limiter, clock) = limiter(1);

        let applied = limiter.handle_rate_limit(&SinkError::rate_limited(Some(Duration::MAX)));
        assert_eq!(applied, Duration::from_secs(60));

        limiter.set_pause(Duration::MAX, "test");
        assert_eq!(limiter.pause_remaining(), Duration::from_secs(60));

        clock.advance(Duration::from_secs(60));
        assert!(limiter.check_rate_limit().is_ok());
    }

    #[test]
    fn stats_track_delays() {
        let (limiter, clock) = limiter(0);

        assert!(limiter.check_rate_limit().is_err());
        limiter.set_pause(Duration::from_secs(3), "test");
        clock.advance(Duration::from_secs(1));

        let stats = limiter.stats();
        assert_eq!(stats.delay_count, 2);
        assert_eq!(stats.average_delay, Duration::from_secs(2));
        assert_eq!(stats.max_delay, Duration::from_secs(3));
        assert_eq!(stats.since_last_hit, Some(Duration::from_secs(1)));
        assert_eq!(stats.pause_remaining, Duration::from_secs(2));
        assert_eq!(stats.pause_reason.as_deref(), Some("test"));
    }
}
