//! Deterministic retry policy.
//!
//! Kept as plain free functions over a `u32` attempt count, not methods on a
//! stateful message object. Isolates policy from data and keeps it a
//! trivial table test.

use std::time::Duration;

pub const MAX_RETRIES: u32 = 5;
pub const BASE_DELAY_SECS: u64 = 1;
pub const MAX_DELAY_SECS: u64 = 16;

/// `delay(attempt) = min(BASE_DELAY * 2^attempt, MAX_DELAY)`.
pub fn delay(attempt: u32) -> Duration {
    let secs = BASE_DELAY_SECS
        .checked_shl(attempt)
        .unwrap_or(u64::MAX)
        .min(MAX_DELAY_SECS);
    Duration::from_secs(secs)
}

/// `canRetry(attempt) = attempt < MAX_RETRIES`.
pub fn can_retry(attempt: u32) -> bool {
    attempt < MAX_RETRIES
}

/// `delay` with up to ±20% jitter, never exceeding `MAX_DELAY_SECS`.
pub fn jittered_delay(attempt: u32) -> Duration {
    let base = delay(attempt);
    let jitter_frac = (rand::random::<f64>() * 0.4) - 0.2; // [-0.2, 0.2)
    let jittered = base.as_secs_f64() * (1.0 + jitter_frac);
    let capped = jittered.clamp(0.0, MAX_DELAY_SECS as f64);
    Duration::from_secs_f64(capped)
}
