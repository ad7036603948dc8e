//! Exponential reconnect backoff.

use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Attempt counter plus the current base wait.
///
/// The base wait grows geometrically and is capped; it never decreases until
/// [`Backoff::reset`]. Jitter is applied separately so the base sequence stays
/// deterministic.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial_delay();
        Self {
            config,
            attempt: 0,
            current,
        }
    }

    /// Attempts handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    /// Advance to the next attempt and return its base wait, or `None` once
    /// `max_attempts` attempts have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = if self.attempt == 0 {
            self.config.initial_delay()
        } else {
            let grown = (self.current.as_millis() as f64 * self.config.multiplier).round();
            Duration::from_millis(grown.min(self.config.max_delay_ms as f64) as u64)
        };
        self.attempt += 1;
        self.current = delay.max(self.current).min(self.config.max_delay());
        Some(self.current)
    }

    /// Base wait plus up to `jitter * base` of random spread.
    pub fn jittered(&self, base: Duration) -> Duration {
        if self.config.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::rng().random_range(0.0..self.config.jitter);
        base + base.mul_f64(spread)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = self.config.initial_delay();
    }
}
