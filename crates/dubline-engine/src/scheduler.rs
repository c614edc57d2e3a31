use std::time::Duration;

use tokio::time::Instant;

/// Throttles time updates to at most one per `min_interval`.
#[derive(Debug)]
pub struct TickScheduler {
    min_interval: Duration,
    last_tick: Option<Instant>,
}

impl TickScheduler {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_tick: None,
        }
    }

    /// Returns `true` and records `now` if a tick may run.
    pub fn accept(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_tick {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last_tick = Some(now);
        true
    }

    /// Forget the last tick so the next `accept` always passes.
    pub fn force(&mut self) {
        self.last_tick = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_ticks_inside_interval() {
        let mut s = TickScheduler::new(Duration::from_millis(250));
        let t0 = Instant::now();
        assert!(s.accept(t0));
        assert!(!s.accept(t0 + Duration::from_millis(100)));
        assert!(!s.accept(t0 + Duration::from_millis(249)));
        assert!(s.accept(t0 + Duration::from_millis(250)));
        assert!(!s.accept(t0 + Duration::from_millis(300)));
    }

    #[test]
    fn test_force_bypasses_throttle() {
        let mut s = TickScheduler::new(Duration::from_millis(250));
        let t0 = Instant::now();
        assert!(s.accept(t0));
        s.force();
        assert!(s.accept(t0 + Duration::from_millis(10)));
        assert!(!s.accept(t0 + Duration::from_millis(20)));
    }
}
