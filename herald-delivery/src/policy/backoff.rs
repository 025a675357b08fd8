//! Exponential backoff with optional jitter

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `retry_count + 1`.
///
/// # Formula
/// `delay = min(base * multiplier^retry_count, max_delay) * (1 ± jitter_factor)`
///
/// A `jitter_factor` of zero gives a deterministic delay.
#[must_use]
pub fn compute_backoff_delay(
    retry_count: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter_factor: f64,
) -> Duration {
    let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
    let max_ms = max_delay.as_secs_f64() * 1000.0;

    // Overflow to infinity is fine: `min` brings it back to the cap.
    let delay_ms = (base_delay.as_secs_f64() * 1000.0 * multiplier.powi(exponent)).min(max_ms);

    let delay_ms = if jitter_factor > 0.0 {
        let jitter_range = delay_ms * jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        delay_ms + jitter
    } else {
        delay_ms
    };

    // Intentional truncation after rounding; the value is clamped to >= 0.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let millis = delay_ms.max(0.0).round() as u64;

    Duration::from_millis(millis)
}
