//! Wall-clock abstraction.
//!
//! Admission windows, logical cache expiry and id timestamps all read the
//! clock through this trait so tests can pin it.

use crate::Timestamp;
use chrono::Utc;
use std::sync::{Arc, RwLock};

/// Source of the current UTC time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A manually driven clock for tests and replays.
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: Arc<RwLock<Timestamp>>,
}

impl FixedClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        match self.now.write() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let next = self.now() + by;
        self.set(next);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fixed_clock_advance() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 59).unwrap();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(clock.now(), Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 1).unwrap());
    }

    #[test]
    fn test_fixed_clock_clones_share_time() {
        let clock = FixedClock::new(Utc::now());
        let other = clock.clone();
        let later = clock.now() + chrono::Duration::hours(1);
        other.set(later);
        assert_eq!(clock.now(), later);
    }
}
