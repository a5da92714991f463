use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Wall-clock abstraction for the control cycle and the pending-dose ledger.
///
/// - now(): current UTC time
/// - minutes_since(): helper returning fractional minutes elapsed since `t`
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    /// Minutes elapsed since `t`; negative when `t` lies in the future.
    fn minutes_since(&self, t: DateTime<Utc>) -> f64 {
        let d = self.now().signed_duration_since(t);
        d.num_milliseconds() as f64 / 60_000.0
    }
}

/// Real clock backed by `chrono::Utc::now`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock whose time is set and advanced manually.
///
/// Clones share the same underlying instant, so a clone handed to a ledger
/// worker observes `advance` calls made by the test.
#[derive(Debug, Clone)]
pub struct ManualClock {
    at: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            at: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, d: Duration) {
        if let Ok(mut at) = self.at.lock() {
            *at += d;
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, t: DateTime<Utc>) {
        if let Ok(mut at) = self.at.lock() {
            *at = t;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.at.lock().map(|g| *g).unwrap_or_else(|e| *e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances_shared_state() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(t0);
        let other = clock.clone();
        clock.advance(Duration::minutes(5));
        assert_eq!(other.now(), t0 + Duration::minutes(5));
        assert!((other.minutes_since(t0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn minutes_since_future_is_negative() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(t0);
        assert!(clock.minutes_since(t0 + Duration::minutes(2)) < 0.0);
    }
}
