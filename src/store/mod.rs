//! # Negotiation Store
//!
//! ## Architecture: Lease-then-save persistence
//!
//! Every worker that wants to act on a negotiation first *leases* it. A lease
//! is an exclusive, time-bounded claim owned by a named holder (one per worker
//! or process). `save` writes the entity back and releases the lease, so the
//! same call serves both "progressed" and "rolled back for retry".
//!
//! ## Guarantees
//!
//! - **At-most-one lease**: lease acquisition is a single atomic operation per
//!   implementation (one mutex section in memory, one conditional `UPDATE` in
//!   PostgreSQL), so two callers never receive the same entity concurrently
//! - **Crash recovery**: a lease older than its duration is treated as absent
//!   and may be re-acquired by any holder
//! - **Due filtering**: pending entities and entities still backing off
//!   (`retry_at` in the future) are never selected by `next_not_leased`

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::clock::saturating_add;
use crate::error::StoreResult;
use crate::models::{Negotiation, NegotiationType};
use crate::state_machine::NegotiationState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use in_memory::InMemoryNegotiationStore;
#[cfg(feature = "postgres")]
pub use postgres::PgNegotiationStore;

/// Filter for scheduler pickup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criteria {
    pub state: NegotiationState,
    pub negotiation_type: Option<NegotiationType>,
}

impl Criteria {
    pub fn new(state: NegotiationState) -> Self {
        Self {
            state,
            negotiation_type: None,
        }
    }

    pub fn with_type(mut self, negotiation_type: NegotiationType) -> Self {
        self.negotiation_type = Some(negotiation_type);
        self
    }

    /// Whether `negotiation` is due for processing under this filter at `now`
    pub fn matches(&self, negotiation: &Negotiation, now: DateTime<Utc>) -> bool {
        negotiation.state() == self.state
            && self
                .negotiation_type
                .map_or(true, |t| t == negotiation.negotiation_type())
            && negotiation.is_due(now)
    }
}

/// Exclusive claim on one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub leased_by: String,
    pub leased_at: DateTime<Utc>,
    pub duration: Duration,
}

impl Lease {
    pub fn new(leased_by: impl Into<String>, leased_at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            leased_by: leased_by.into(),
            leased_at,
            duration,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        saturating_add(self.leased_at, self.duration)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }
}

#[async_trait]
pub trait NegotiationStore: Send + Sync {
    /// Identity written into every lease this store acquires
    fn lease_holder(&self) -> &str;

    /// Atomically select and lease up to `batch_size` due entities
    async fn next_not_leased(
        &self,
        batch_size: usize,
        criteria: &Criteria,
    ) -> StoreResult<Vec<Negotiation>>;

    /// Persist all fields and release this holder's lease
    async fn save(&self, negotiation: &Negotiation) -> StoreResult<()>;

    /// Release this holder's lease without writing the entity
    async fn break_lease(&self, id: &str) -> StoreResult<()>;

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Negotiation>>;

    async fn find_by_correlation_id(&self, correlation_id: &str)
        -> StoreResult<Option<Negotiation>>;

    /// Point lookup that also acquires the lease; `LeaseHeld` if already leased
    async fn find_by_id_and_lease(&self, id: &str) -> StoreResult<Option<Negotiation>>;

    async fn find_by_correlation_id_and_lease(
        &self,
        correlation_id: &str,
    ) -> StoreResult<Option<Negotiation>>;
}
