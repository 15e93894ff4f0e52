//! Exponential reconnect backoff.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Stateless backoff policy: computes the delay before a given attempt.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Returns the delay before the `attempt`-th reconnect (1-based).
    /// Returns `None` when reconnecting is disabled or attempts are exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.config.min_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = base_ms.min(self.config.max_delay_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Returns `true` if the `attempt`-th reconnect (1-based) is allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        if !self.config.enabled || attempt == 0 {
            return false;
        }
        match self.config.max_attempts {
            Some(max) => attempt <= max,
            None => true,
        }
    }
}
