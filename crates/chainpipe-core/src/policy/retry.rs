//! Fixed or exponential backoff retry policy.

use std::time::Duration;

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one. `0` means unbounded.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Cap on the delay.
    pub max_backoff: Duration,
    /// Growth factor per failure. `1.0` gives a fixed delay.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(2),
            multiplier: 1.0,
        }
    }
}

/// Stateless retry policy: computes the delay that follows a given failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// `max_attempts` tries with the same `delay` between them.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(RetryConfig {
            max_attempts,
            initial_backoff: delay,
            max_backoff: delay,
            multiplier: 1.0,
        })
    }

    /// Unbounded attempts, doubling from `initial` up to `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::new(RetryConfig {
            max_attempts: 0,
            initial_backoff: initial,
            max_backoff: max.max(initial),
            multiplier: 2.0,
        })
    }

    /// Delay after the `failures`-th consecutive failure (1-based), ignoring
    /// the attempt bound.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi(exp);
        let cap_ms = self.config.max_backoff.as_millis() as f64;
        Duration::from_millis(base_ms.min(cap_ms) as u64)
    }

    /// Delay before the next attempt after `failures` failures, or `None`
    /// once the attempt budget is spent.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if !self.should_retry(failures) {
            return None;
        }
        Some(self.backoff(failures))
    }

    /// Returns `true` if another attempt is allowed after `failures` failures.
    pub fn should_retry(&self, failures: u32) -> bool {
        self.config.max_attempts == 0 || failures < self.config.max_attempts
    }
}
