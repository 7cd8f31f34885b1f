//! # Retry Processor
//!
//! Runs one outbound call for a transition and classifies the result into an
//! [`Outcome`]. The caller matches the outcome exhaustively; each arm performs
//! exactly one persisted state change:
//!
//! - `Success` → the role's forward transition
//! - `RetryableFailure` → [`Negotiation::mark_retry`] (same state, backoff)
//! - `FinalFailure` → terminal failure with an error detail
//!
//! Retries are not a tight loop: a retryable failure releases the lease and
//! the entity comes back on a later scheduler tick once `retry_at` passes.

use super::backoff::BackoffCalculator;
use crate::clock::saturating_add;
use crate::config::RetryConfig;
use crate::error::DispatchError;
use crate::models::Negotiation;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<R> {
    Success(R),
    RetryableFailure(DispatchError),
    FinalFailure(DispatchError),
}

#[derive(Debug, Clone)]
pub struct RetryProcessor {
    backoff: BackoffCalculator,
    dispatch_timeout: Duration,
}

impl RetryProcessor {
    pub fn new(retry: RetryConfig, dispatch_timeout: Duration) -> Self {
        Self {
            backoff: BackoffCalculator::new(retry),
            dispatch_timeout,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.backoff.config().max_attempts
    }

    /// Attempt `operation` once for the current step of `negotiation`
    #[instrument(
        skip(self, negotiation, operation),
        fields(
            negotiation_id = %negotiation.id(),
            state = %negotiation.state(),
            attempt = negotiation.retry_count() + 1
        )
    )]
    pub async fn execute<R, Fut>(
        &self,
        negotiation: &Negotiation,
        description: &str,
        operation: Fut,
    ) -> Outcome<R>
    where
        Fut: Future<Output = Result<R, DispatchError>>,
    {
        let error = match tokio::time::timeout(self.dispatch_timeout, operation).await {
            Ok(Ok(response)) => {
                debug!(description, "Dispatch succeeded");
                return Outcome::Success(response);
            }
            Ok(Err(error)) => error,
            Err(_) => DispatchError::Timeout(self.dispatch_timeout),
        };

        let attempt = negotiation.retry_count() + 1;
        if !error.is_retryable() || attempt >= self.max_attempts() {
            warn!(
                description,
                attempt,
                max_attempts = self.max_attempts(),
                error = %error,
                "Dispatch failed permanently"
            );
            Outcome::FinalFailure(error)
        } else {
            debug!(
                description,
                attempt,
                max_attempts = self.max_attempts(),
                error = %error,
                "Dispatch failed, will retry"
            );
            Outcome::RetryableFailure(error)
        }
    }

    /// When the next attempt of the current step may run
    pub fn retry_at(&self, negotiation: &Negotiation, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff.delay_for(negotiation.retry_count());
        saturating_add(now, delay)
    }
}
