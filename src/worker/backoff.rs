/// Retry delay for event records
use std::time::Duration;

/// `min(2^retry_count seconds, cap)`
pub fn retry_delay(retry_count: i64, cap: Duration) -> Duration {
    let exponent = retry_count.clamp(0, 63) as u32;
    let secs = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(cap)
}
