//! Wall-clock source for call timestamps
//!
//! TTLs and timers run on the tokio clock; call start/connect/end stamps come
//! from a [`Clock`] so history durations can be pinned in tests.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt::Debug;

/// Milliseconds since the Unix epoch
pub trait Clock: Send + Sync + Debug {
    fn now_millis(&self) -> u64;
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Convert epoch milliseconds into a UTC timestamp
pub fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis as i64).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemClock.now_millis() > 1_600_000_000_000);
    }

    #[test]
    fn test_millis_round_trip() {
        let at = millis_to_datetime(1_700_000_000_123);
        assert_eq!(at.timestamp_millis(), 1_700_000_000_123);
    }
}
