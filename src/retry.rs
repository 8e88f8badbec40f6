//! Bounded retry policy for join attempts.

use std::time::Duration;

/// Attempt count, exponential backoff and per-attempt timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_factor: f64,
    pub backoff_cap: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            backoff_factor: 2.0,
            backoff_cap: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-indexed) failed attempt.
    ///
    /// base * factor^(attempt - 1), capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.backoff_base.as_secs_f64() * self.backoff_factor.powi(exponent);
        let cap = self.backoff_cap.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            self.backoff_cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Worst-case wall time of a full attempt sequence: every attempt hitting
    /// its timeout plus every backoff in between.
    /// Saturates at `Duration::MAX`.
    pub fn total_budget(&self) -> Duration {
        let attempts = self.attempt_timeout.saturating_mul(self.max_attempts);
        (1..self.max_attempts)
            .map(|a| self.delay_after(a))
            .fold(attempts, Duration::saturating_add)
    }
}
