//! Retry policy with jittered exponential backoff

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for transient job failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after the first failure; 0 disables retries
    pub max_retries: u32,
    /// Delay before the first retry (milliseconds)
    pub base_delay_ms: u64,
    /// Ceiling for any single delay (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    /// Nominal (un-jittered) delay before retry `attempt` (1-indexed)
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Jittered delay before retry `attempt`
    ///
    /// Uniform between half and the full nominal delay, so a parallel group
    /// retrying together does not hammer the provider in lockstep.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt).as_millis() as u64;
        if nominal == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::rng().random_range(nominal / 2..=nominal);
        Duration::from_millis(jittered)
    }
}
