use std::time::Duration;

use rand::Rng;

use crate::template::RetryTemplate;

/// Workspace key holding the retry counter of one state.
pub fn retry_counter_key(machine: &str, state: &str) -> String {
    format!("sys.retry.{machine}.{state}")
}

/// Delay before retry number `retry_count` (1-based).
///
/// `(2^n − 1) × U(0.8·δ·60, 1.2·δ·60)` seconds, clamped to
/// `[minimum·60, maximum·60]`. Non-decreasing in `n` for any jitter draw.
pub fn backoff<R: Rng + ?Sized>(retry_count: u32, policy: &RetryTemplate, rng: &mut R) -> Duration {
    let min = f64::from(policy.minimum_minutes) * 60.0;
    let max = f64::from(policy.maximum_minutes.max(policy.minimum_minutes)) * 60.0;
    let delta = f64::from(policy.delta_minutes) * 60.0;

    let increment = if delta <= 0.0 || retry_count == 0 {
        0.0
    } else {
        let jitter = rng.gen_range(0.8 * delta..=1.2 * delta);
        let growth = 2f64.powi(retry_count.min(1023) as i32) - 1.0;
        let raw = growth * jitter;
        if raw.is_finite() {
            raw
        } else {
            max
        }
    };
    Duration::from_secs_f64(increment.clamp(min, max))
}
