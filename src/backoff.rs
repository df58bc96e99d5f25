//! Retry backoff: maps an attempt count to a rescheduling delay.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with an upper bound and optional jitter.
///
/// `delay(attempt) = min(max, base * 2^(attempt - 1) * j)` where `j` is drawn
/// uniformly from `[0.5, 1.5)` when `jitter` is set and is `1` otherwise.
///
/// With the defaults (base 2s, max 30s, no jitter):
/// - attempt 1: 2s
/// - attempt 2: 4s
/// - attempt 3: 8s
/// - attempt 5 and later: 30s
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay after the first failed attempt.
    pub base: Duration,
    /// Upper bound applied after jitter.
    pub max: Duration,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self { base, ..Self::default() }
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to apply after `attempt` attempts have been made (1-indexed).
    /// Attempt 0 is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..1.5)
        } else {
            1.0
        };
        self.delay_with_factor(attempt, factor)
    }

    fn delay_with_factor(&self, attempt: u32, factor: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base.as_secs_f64() * 2f64.powi(exponent) * factor;
        let max = self.max.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.max;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}
