//! Trailing debounce expressed as a deadline state machine.
//!
//! The debouncer owns no timer.  The event loop that drives it sleeps until
//! [`Debouncer::deadline`] and then calls [`Debouncer::fire_if_due`], which
//! keeps emission out of the trigger path entirely.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    /// Cancel any pending emission and reschedule it for `now + delay`.
    pub fn trigger(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    /// When the pending emission is due, or `None` when idle.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume the pending emission if its deadline has passed.
    ///
    /// Returns `true` exactly once per quiet period.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(at) if now >= at => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(100);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Replays `triggers` (offsets from t0) and polls every millisecond,
    /// returning the offsets at which an emission fired.
    fn simulate(triggers: &[u64], until: u64) -> Vec<u64> {
        let t0 = Instant::now();
        let mut d = Debouncer::new(DELAY);
        let mut fired = vec![];
        for t in 0..=until {
            let now = t0 + ms(t);
            if d.fire_if_due(now) {
                fired.push(t);
            }
            if triggers.contains(&t) {
                d.trigger(now);
            }
        }
        fired
    }

    #[test]
    fn burst_within_delay_emits_once_after_last_trigger() {
        assert_eq!(simulate(&[0, 20, 40, 60, 80], 1000), [180]);
    }

    #[test]
    fn spaced_triggers_emit_each_time() {
        assert_eq!(simulate(&[0, 200, 400], 1000), [100, 300, 500]);
    }

    #[test]
    fn trigger_never_fires_synchronously() {
        let now = Instant::now();
        let mut d = Debouncer::new(DELAY);
        d.trigger(now);
        assert!(!d.fire_if_due(now));
        assert_eq!(d.deadline(), Some(now + DELAY));
    }

    #[test]
    fn firing_returns_to_idle() {
        let now = Instant::now();
        let mut d = Debouncer::new(DELAY);
        d.trigger(now);
        assert!(d.fire_if_due(now + ms(500)));
        assert_eq!(d.deadline(), None);
        assert!(!d.fire_if_due(now + ms(600)));
    }

    #[test]
    fn zero_delay_fires_on_next_poll() {
        let now = Instant::now();
        let mut d = Debouncer::new(Duration::ZERO);
        d.trigger(now);
        assert!(d.fire_if_due(now));
        assert!(!d.fire_if_due(now));
    }
}
