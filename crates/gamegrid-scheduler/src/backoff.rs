//! Poll interval with exponential backoff on provider errors.

use std::time::Duration;

use tracing::debug;

/// Delay between provider polls.
///
/// Starts at the base interval, doubles after each failure up to the cap,
/// and snaps back to the base interval on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_interval: Duration,
    max_backoff: Duration,
    current: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(base_interval: Duration, max_backoff: Duration) -> Self {
        Self {
            base_interval,
            max_backoff: max_backoff.max(base_interval),
            current: base_interval,
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.current = self.base_interval;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.current = self.current.saturating_mul(2).min(self.max_backoff);
        debug!(
            failures = self.consecutive_failures,
            next = ?self.current,
            "provider call failed, backing off"
        );
    }

    /// Delay before the next poll.
    pub fn next_interval(&self) -> Duration {
        self.current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
