//! Media clock used for capture timestamps and latency measurement
//!
//! Timestamps are microseconds since the Unix epoch, sampled once when the
//! clock is created and advanced from a monotonic `Instant` afterwards. Two
//! hosts with NTP-synchronized wall clocks therefore produce comparable
//! timestamps, while each host's own timeline never steps backwards.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
pub struct MediaClock {
    origin: Instant,
    origin_us: u64,
}

impl MediaClock {
    pub fn new() -> Self {
        let origin_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self {
            origin: Instant::now(),
            origin_us,
        }
    }

    /// Current media time in microseconds
    pub fn now_us(&self) -> u64 {
        self.origin_us + self.origin.elapsed().as_micros() as u64
    }
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = MediaClock::new();
        let a = clock.now_us();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = clock.now_us();
        assert!(b >= a + 2_000);
    }

    #[test]
    fn test_copies_share_timeline() {
        let clock = MediaClock::new();
        let copy = clock;
        let a = clock.now_us();
        let b = copy.now_us();
        assert!(b >= a);
        assert!(b - a < 1_000_000);
    }
}
