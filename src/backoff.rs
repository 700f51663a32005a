//! Exponential backoff for failed stream claims.
//!
//! No jitter and no attempt ceiling: the delay doubles per consecutive
//! failure up to `ceiling` and stays there until a claim succeeds.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    /// `ceiling` below `base` is raised to `base`.
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
            consecutive_failures: 0,
        }
    }

    /// `min(base * 2^n, ceiling)`, saturating.
    pub fn delay_for(&self, n: u32) -> Duration {
        let factor = 2u32.checked_pow(n).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }

    /// Delay the next failure would sleep for.
    pub fn next_delay(&self) -> Duration {
        self.delay_for(self.consecutive_failures)
    }

    /// Register a failure and return how long to sleep before retrying.
    /// The first failure in a streak sleeps `base`.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.next_delay();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        delay
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
