//! Poll backoff: decides how long an idle worker slot sleeps.

use std::time::Duration;

/// Exponential backoff for empty polls: doubles from `min` up to `max`,
/// reset on the next successful lease. Keeps idle periods from spinning the
/// store without adding latency under load.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl PollBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            current: min,
            min,
            max,
        }
    }

    /// Delay to sleep now; advances the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps() {
        let mut backoff = PollBackoff::new(Duration::from_millis(100), Duration::from_secs(5));

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn reset_returns_to_min() {
        let mut backoff = PollBackoff::new(Duration::from_millis(100), Duration::from_secs(5));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
