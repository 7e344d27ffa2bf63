use std::time::{Duration, Instant};

/// Millisecond clock anchored at a fixed origin.
///
/// Used wherever a timestamp travels on the wire and comes back to us, such as the
/// SCTP state cookie or the consent freshness transaction id.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new(origin: Instant) -> Self {
        Self { origin }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Milliseconds elapsed since the origin, saturating at zero for earlier instants.
    pub fn millis(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_millis() as u64
    }

    /// Converts a millisecond reading back into an instant.
    pub fn instant(&self, millis: u64) -> Instant {
        self.origin + Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_round_trip() {
        let origin = Instant::now();
        let clock = MonotonicClock::new(origin);
        let later = origin + Duration::from_millis(1234);
        assert_eq!(clock.millis(later), 1234);
        assert_eq!(clock.instant(1234), later);
        assert_eq!(clock.millis(origin), 0);
    }
}
