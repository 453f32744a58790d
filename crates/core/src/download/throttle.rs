//! Rate limiting of progress updates, and transfer speed estimates.

use std::time::{Duration, Instant};

/// Decides when accumulated progress is worth persisting and broadcasting.
///
/// An update is due once `interval` has passed since the last one, or
/// once `bytes_threshold` bytes arrived since then, whichever comes first.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    bytes_threshold: u64,
    last_emit: Instant,
    pending_bytes: u64,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, bytes_threshold: u64) -> Self {
        Self::starting_at(interval, bytes_threshold, Instant::now())
    }

    pub fn starting_at(interval: Duration, bytes_threshold: u64, now: Instant) -> Self {
        Self {
            interval,
            bytes_threshold: bytes_threshold.max(1),
            last_emit: now,
            pending_bytes: 0,
        }
    }

    /// Account for `bytes` received at `now`; returns true when an update
    /// should be emitted, and starts a new window if so.
    pub fn record(&mut self, bytes: u64, now: Instant) -> bool {
        self.pending_bytes += bytes;
        let due = self.pending_bytes >= self.bytes_threshold
            || now.saturating_duration_since(self.last_emit) >= self.interval;
        if due {
            self.last_emit = now;
            self.pending_bytes = 0;
        }
        due
    }

    /// Bytes received since the last emitted update.
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }
}

/// Average speed of one transfer attempt.
#[derive(Debug, Clone, Copy)]
pub struct TransferRate {
    started: Instant,
}

impl TransferRate {
    pub fn starting_at(started: Instant) -> Self {
        Self { started }
    }

    /// Bytes per second for `bytes` received by `now`.
    pub fn speed_bps(&self, bytes: u64, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (bytes as f64 / elapsed) as u64
    }
}

/// Seconds left for `remaining` bytes at `speed_bps`.
pub fn eta_secs(remaining: Option<u64>, speed_bps: u64) -> Option<u64> {
    let remaining = remaining?;
    if speed_bps == 0 {
        return None;
    }
    Some(remaining.div_ceil(speed_bps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::starting_at(Duration::from_secs(1), u64::MAX, start);

        assert!(!throttle.record(10, start + Duration::from_millis(200)));
        assert!(!throttle.record(10, start + Duration::from_millis(900)));
        assert_eq!(throttle.pending_bytes(), 20);
        assert!(throttle.record(10, start + Duration::from_millis(1000)));
        assert_eq!(throttle.pending_bytes(), 0);

        // The window restarts at the emitted update
        assert!(!throttle.record(10, start + Duration::from_millis(1500)));
        assert!(throttle.record(10, start + Duration::from_millis(2000)));
    }

    #[test]
    fn test_byte_threshold() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::starting_at(Duration::from_secs(60), 100, start);

        assert!(!throttle.record(60, start));
        assert!(throttle.record(60, start));
        assert!(!throttle.record(99, start));
        assert!(throttle.record(1, start));
    }

    #[test]
    fn test_speed_and_eta() {
        let start = Instant::now();
        let rate = TransferRate::starting_at(start);

        assert_eq!(rate.speed_bps(1000, start), 0);
        let speed = rate.speed_bps(1000, start + Duration::from_secs(2));
        assert_eq!(speed, 500);

        assert_eq!(eta_secs(Some(1000), speed), Some(2));
        assert_eq!(eta_secs(Some(1001), speed), Some(3));
        assert_eq!(eta_secs(None, speed), None);
        assert_eq!(eta_secs(Some(10), 0), None);
    }
}
