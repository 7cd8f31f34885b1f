//! # Backoff Calculator
//!
//! Exponential backoff between retry ticks: `base * multiplier^retries`,
//! capped at the configured maximum, with optional symmetric jitter to keep
//! workers from retrying a failing counter-party in lockstep.

use crate::config::RetryConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: RetryConfig,
}

impl BackoffCalculator {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the attempt following `retry_count` failures
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base_delay = self.config.base_delay_ms as f64;
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let exponential_delay = base_delay * self.config.multiplier.powi(exponent);

        let mut delay_ms = exponential_delay.min(self.config.max_delay_ms as f64) as u64;

        if self.config.jitter_enabled {
            delay_ms = self.apply_jitter(delay_ms);
        }

        Duration::from_millis(delay_ms)
    }

    fn apply_jitter(&self, delay_ms: u64) -> u64 {
        use rand::Rng;

        let jitter_range = (delay_ms as f64 * self.config.max_jitter) as u64;
        if jitter_range == 0 {
            return delay_ms;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0..=jitter_range);

        if rng.gen_bool(0.5) {
            delay_ms.saturating_add(jitter)
        } else {
            delay_ms.saturating_sub(jitter)
        }
    }
}
