//! Retry backoff schedule for failed sync cycles.

use std::time::Duration;

use tidesync_domain::constants::{RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS};

/// Delay before the next sync attempt.
///
/// `retry_count` is the failure count after the increment, so the first
/// failure (count 1) schedules 2 000 ms, the second 4 000 ms, doubling up
/// to the 60 s ceiling.
pub fn retry_delay(retry_count: u32) -> Duration {
    let exponent = retry_count.min(16);
    let ms = RETRY_BASE_DELAY_MS
        .checked_shl(exponent)
        .unwrap_or(RETRY_MAX_DELAY_MS)
        .min(RETRY_MAX_DELAY_MS);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_doubles_from_two_seconds() {
        let delays: Vec<u64> = (1..=5).map(|n| retry_delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![2_000, 4_000, 8_000, 16_000, 32_000]);
    }

    #[test]
    fn schedule_is_capped_at_one_minute() {
        assert_eq!(retry_delay(6), Duration::from_millis(60_000));
        assert_eq!(retry_delay(30), Duration::from_millis(60_000));
        assert_eq!(retry_delay(u32::MAX), Duration::from_millis(60_000));
    }
}
