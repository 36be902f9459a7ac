//! Exponential backoff state.

use std::time::Duration;

/// Tracks the delay before the next retry and how many retries were used.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            current: initial.min(max),
            max,
            multiplier: multiplier.max(1.0),
            attempts: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Count one retry and grow the delay, capped at the maximum.
    pub fn advance(&mut self) {
        self.attempts += 1;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
    }
}
