use std::time::Duration;

/// Delay before reconnect attempt `attempt` (1-based):
/// `base * 2^(attempt-1)`. The shift is clamped so absurd attempt counts
/// saturate instead of overflowing.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}
