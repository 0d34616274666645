//! Retry policy: decides backoff delays.

use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff for transient store errors.
///
/// Used by the worker loop when polling fails and when a status report has to
/// be retried. Task failures are never retried automatically.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before the next try after `failures` consecutive failures
    /// (1-indexed): `base_delay * multiplier^(failures - 1)`, capped at
    /// `max_delay`.
    ///
    /// With base_delay=200ms, multiplier=2.0:
    /// - failure 1: 200ms
    /// - failure 2: 400ms
    /// - failure 3: 800ms
    pub fn next_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms.max(0.0).round() as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
