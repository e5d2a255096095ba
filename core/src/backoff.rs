//! Exponential backoff used by restart and polling loops.

use std::time::Duration;

/// Doubling delay with an upper bound.
#[derive(Debug, Clone)]
pub struct ExpBackoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl ExpBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn delay(&mut self) -> Duration {
        let current = self.next;
        self.next = current.saturating_mul(2).min(self.max);
        current
    }

    /// Restarts from the initial delay after a successful attempt.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for ExpBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
