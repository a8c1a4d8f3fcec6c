//! Per-topic reconnect bookkeeping with capped exponential backoff.
//!
//! The hub owns one [`ReconnectBudget`] per topic. Callers that reconnect to
//! something on behalf of a topic (a polled daemon, a client-facing feed) report
//! each failed attempt and receive the delay to wait before the next one, or a
//! terminal answer once the budget is spent.

use std::time::Duration;

/// Backoff configuration shared by all topics
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Growth factor applied per additional failure
    pub multiplier: f64,
    /// Backoff caps at this value
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let scaled = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(scaled.round() as u64)
        }
    }
}

/// Consecutive-failure counter for one topic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectBudget {
    failures: u32,
}

impl ReconnectBudget {
    /// Record a failed attempt.
    ///
    /// Returns the backoff delay, or `None` once more than `max_attempts`
    /// consecutive failures have been recorded.
    pub fn fail(&mut self, policy: &ReconnectPolicy) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures > policy.max_attempts {
            None
        } else {
            Some(policy.delay_for(self.failures))
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_exhausted(&self, policy: &ReconnectPolicy) -> bool {
        self.failures > policy.max_attempts
    }
}
