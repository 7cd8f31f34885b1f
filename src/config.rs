//! # Configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables prefixed with `NEGOTIATION__` (double underscore separates
//! nesting, e.g. `NEGOTIATION__RETRY__MAX_ATTEMPTS=5`).
//!
//! ```toml
//! [state_machine]
//! batch_size = 20
//! poll_interval_ms = 1000
//! lease_duration_ms = 60000
//!
//! [retry]
//! max_attempts = 7
//! base_delay_ms = 1000
//! max_delay_ms = 60000
//!
//! [dispatch]
//! timeout_ms = 10000
//! ```

use crate::error::{NegotiationError, NegotiationResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const ENV_PREFIX: &str = "NEGOTIATION";

/// Upper bound for every millisecond setting (30 days)
pub const MAX_DURATION_MS: u64 = 30 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub state_machine: StateMachineConfig,
    pub retry: RetryConfig,
    pub dispatch: DispatchConfig,
    pub database: DatabaseConfig,
}

/// Scheduler settings, shared by both roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMachineConfig {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub lease_duration_ms: u64,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            poll_interval_ms: 1000,
            lease_duration_ms: 60_000,
        }
    }
}

impl StateMachineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }
}

/// Backoff and retry budget for outbound dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total dispatch attempts per logical step, first attempt included
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_enabled: bool,
    /// Maximum jitter as a fraction of the delay (0.0 to 1.0)
    pub max_jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_enabled: true,
            max_jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Fixed, jitter-free policy; handy for deterministic tests
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            max_attempts,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter_enabled: false,
            max_jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

impl NegotiationConfig {
    /// Load from an optional TOML file plus `NEGOTIATION__*` overrides
    pub fn load(path: Option<&Path>) -> NegotiationResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;

        debug!(
            batch_size = config.state_machine.batch_size,
            max_attempts = config.retry.max_attempts,
            dispatch_timeout_ms = config.dispatch.timeout_ms,
            "Negotiation configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> NegotiationResult<()> {
        if self.state_machine.batch_size == 0 {
            return Err(NegotiationError::Configuration(
                "state_machine.batch_size must be greater than zero".into(),
            ));
        }
        if self.state_machine.poll_interval_ms == 0 {
            return Err(NegotiationError::Configuration(
                "state_machine.poll_interval_ms must be greater than zero".into(),
            ));
        }
        for (name, value) in [
            ("state_machine.poll_interval_ms", self.state_machine.poll_interval_ms),
            ("state_machine.lease_duration_ms", self.state_machine.lease_duration_ms),
            ("retry.max_delay_ms", self.retry.max_delay_ms),
            ("dispatch.timeout_ms", self.dispatch.timeout_ms),
        ] {
            if value > MAX_DURATION_MS {
                return Err(NegotiationError::Configuration(format!(
                    "{name} ({value}) must not exceed {MAX_DURATION_MS}"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(NegotiationError::Configuration(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(NegotiationError::Configuration(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.max_jitter) {
            return Err(NegotiationError::Configuration(
                "retry.max_jitter must be between 0.0 and 1.0".into(),
            ));
        }
        // A dispatch outliving the lease could be processed twice
        if self.dispatch.timeout_ms >= self.state_machine.lease_duration_ms {
            return Err(NegotiationError::Configuration(format!(
                "dispatch.timeout_ms ({}) must be shorter than \
                     state_machine.lease_duration_ms ({})",
                self.dispatch.timeout_ms, self.state_machine.lease_duration_ms
            )));
        }
        Ok(())
    }
}
