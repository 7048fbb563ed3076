//! Retry delays for reconnects and store reloads.

use std::time::Duration;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)` plus
/// up to 25% jitter, never more than `cap`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    let delay_ms = base_ms.saturating_mul(1u64 << exponent).min(cap_ms);
    let jitter = rand::random::<u64>() % (delay_ms / 4 + 1);

    Duration::from_millis((delay_ms + jitter).min(cap_ms))
}
