//! Time source for breaker and degradation transitions.
//!
//! Production uses [`SystemClock`]. Tests drive transitions with a
//! [`ManualClock`] instead of sleeping through reset timeouts.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Monotonic plus wall-clock time source
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant used for all comparisons
    fn now(&self) -> Instant;

    /// Wall-clock time used only for reporting
    fn utc_now(&self) -> DateTime<Utc>;

    /// Converts a future (or past) monotonic instant into wall-clock time
    fn to_utc(&self, at: Instant) -> DateTime<Utc> {
        let now = self.now();
        let utc = self.utc_now();
        if at >= now {
            utc + chrono::Duration::from_std(at - now).unwrap_or_else(|_| chrono::Duration::zero())
        } else {
            utc - chrono::Duration::from_std(now - at).unwrap_or_else(|_| chrono::Duration::zero())
        }
    }
}

/// The real clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    base_utc: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            base_utc: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Moves the clock forward
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    fn offset(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.offset()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.base_utc + chrono::Duration::from_std(self.offset()).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_both_sources() {
        let clock = ManualClock::new();
        let start = clock.now();
        let start_utc = clock.utc_now();

        clock.advance(Duration::from_secs(30));

        assert_eq!(clock.now() - start, Duration::from_secs(30));
        assert_eq!((clock.utc_now() - start_utc).num_seconds(), 30);
    }

    #[test]
    fn test_to_utc_projects_future_instants() {
        let clock = ManualClock::new();
        let at = clock.now() + Duration::from_secs(10);
        let projected = clock.to_utc(at);
        assert_eq!((projected - clock.utc_now()).num_seconds(), 10);
    }
}
