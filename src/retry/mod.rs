//! # Retry
//!
//! Bounded retry with backoff around every outbound dispatch.

pub mod backoff;
pub mod processor;

pub use backoff::BackoffCalculator;
pub use processor::{Outcome, RetryProcessor};
