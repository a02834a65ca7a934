use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffConfig {
    pub const fn outbox_default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::outbox_default()
    }
}

/// Delay before the next attempt after `attempts` consecutive failures.
///
/// Deterministic doubling capped at `max_delay`; the delay sequence is
/// monotonically non-decreasing, which is what the retry scheduler relies on.
pub fn retry_delay(config: BackoffConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    let factor = 2u128.saturating_pow(exponent);
    let raw_ms = config
        .base_delay
        .as_millis()
        .saturating_mul(factor)
        .min(config.max_delay.as_millis()) as u64;

    Duration::from_millis(raw_ms)
}
