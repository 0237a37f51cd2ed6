//! # Backoff Calculator
//!
//! Exponential backoff with additive jitter for advised retries.
//!
//! For attempt `n >= 1` the raw delay is `min(base * 2^(n-1), max)`. Jitter
//! adds up to a quarter of the raw delay on top and never subtracts, so every
//! result lies in `[raw, 1.25 * raw]`. Attempts `<= 0` have no delay.

use crate::orchestration::retry_policy::RetryPolicy;
use rand::Rng;
use std::time::Duration;

/// Jitter ceiling as a fraction of the raw delay
pub const MAX_JITTER_FRACTION: f64 = 0.25;

/// Capped exponential delay without jitter
pub fn raw_delay(policy: &RetryPolicy, attempt: i64) -> Duration {
    if attempt <= 0 {
        return Duration::ZERO;
    }
    // 2^31 seconds of base is already far past any sane cap
    let exponent = u32::try_from(attempt - 1).unwrap_or(u32::MAX).min(31);
    let uncapped = policy
        .backoff_base
        .checked_mul(1u32 << exponent)
        .unwrap_or(policy.backoff_max);
    uncapped.min(policy.backoff_max)
}

/// Delay with `jitter_fraction` of the maximum jitter applied.
///
/// `jitter_fraction` is clamped to `[0, 1]`; `0` yields the raw delay and `1`
/// yields `1.25 * raw`.
pub fn delay_with_jitter(policy: &RetryPolicy, attempt: i64, jitter_fraction: f64) -> Duration {
    let raw = raw_delay(policy, attempt);
    if raw.is_zero() {
        return raw;
    }
    let fraction = jitter_fraction.clamp(0.0, 1.0);
    raw + raw.mul_f64(MAX_JITTER_FRACTION * fraction)
}

/// Delay before retry number `attempt`, with random jitter
pub fn delay(policy: &RetryPolicy, attempt: i64) -> Duration {
    let fraction = rand::rng().random_range(0.0..=1.0);
    delay_with_jitter(policy, attempt, fraction)
}
