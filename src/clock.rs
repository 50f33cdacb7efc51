//! The loop's view of time.
//!
//! `Instant::now()` is cheap but not free, and a burst of callbacks does not
//! need a fresh timestamp each. The loop snaps the clock once per gathering
//! step (right after the poll returns) and everything in that burst reads
//! the cached value. The trade-off: the time may be slightly stale if a
//! callback runs long.

use std::time::{Duration, Instant};

pub(crate) struct LoopClock {
    now: Instant,
}

impl LoopClock {
    pub fn new() -> Self {
        LoopClock {
            now: Instant::now(),
        }
    }

    /// Refresh the cached timestamp.
    pub fn snap(&mut self) {
        self.now = Instant::now();
    }

    /// The time of the last snap.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// How long from the cached now until `deadline`, zero if already past.
    pub fn until(&self, deadline: Instant) -> Duration {
        deadline.saturating_duration_since(self.now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_moves_forward() {
        let mut clock = LoopClock::new();
        let first = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        clock.snap();
        assert!(clock.now() > first);
    }

    #[test]
    fn until_saturates() {
        let clock = LoopClock::new();
        let past = clock.now() - Duration::from_secs(1);
        assert_eq!(Duration::ZERO, clock.until(past));
        let future = clock.now() + Duration::from_secs(1);
        assert!(clock.until(future) > Duration::from_millis(900));
    }
}
