use std::time::Duration;

use rand::Rng;

use crate::config::RetrySection;

use super::error::FailureKind;

/// Pure retry decision: no clocks, no sleeping. Workers apply the delay
/// themselves so the policy stays trivially testable.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    multiplier: f64,
    max_backoff: Duration,
    jitter: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    pub fn new(config: &RetrySection) -> Self {
        let base_backoff = Duration::from_millis(config.base_backoff_ms);
        let max_backoff = Duration::from_millis(config.max_backoff_ms).max(base_backoff);
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff,
            multiplier: config.backoff_multiplier.max(1.0),
            max_backoff,
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Deterministic part of the backoff schedule: geometric growth from
    /// the base delay, capped. `attempt` is the 1-based number of the
    /// attempt that just failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.base_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn decide(&self, attempt: u32, kind: FailureKind) -> RetryDecision {
        if attempt >= self.max_attempts || !kind.is_transient() {
            return RetryDecision::GiveUp;
        }
        let mut delay = self.delay_for_attempt(attempt);
        if !self.jitter.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
            delay = (delay + Duration::from_millis(extra)).min(self.max_backoff);
        }
        RetryDecision::Retry { delay }
    }
}
