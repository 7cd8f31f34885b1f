//! Error types for the negotiation core.
//!

use std::time::Duration;
use thiserror::Error;

/// Top-level error for negotiation operations
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Negotiation not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Errors raised by [`crate::store::NegotiationStore`] implementations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Negotiation {id} is leased by {holder}")]
    LeaseHeld { id: String, holder: String },

    #[error("A {negotiation_type} negotiation with correlation id {correlation_id} already exists")]
    DuplicateCorrelation {
        correlation_id: String,
        negotiation_type: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised while sending a protocol message to the counter-party
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Counter-party unreachable at {address}: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("Message rejected by counter-party: {0}")]
    Rejected(String),

    #[error("Dispatch timed out after {0:?}")]
    Timeout(Duration),
}

pub type NegotiationResult<T> = Result<T, NegotiationError>;
pub type StoreResult<T> = Result<T, StoreError>;

impl NegotiationError {
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl DispatchError {
    /// Explicit rejections are final; transport problems are worth retrying
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

impl From<config::ConfigError> for NegotiationError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
