//! # In-Memory Negotiation Store
//!
//! Thread-safe store for tests and single-process deployments. All entities
//! and leases live behind one `parking_lot::Mutex`, which makes
//! select-and-lease a single critical section.
//!
//! Clones share the same backing state. Use [`InMemoryNegotiationStore::with_holder`]
//! to simulate several workers contending for the same records.

use super::{Criteria, Lease, NegotiationStore};
use crate::clock::{SharedClock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::models::Negotiation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Debug, Default)]
struct StoreState {
    entities: HashMap<String, Negotiation>,
    leases: HashMap<String, Lease>,
}

impl StoreState {
    fn live_lease(&self, id: &str, now: DateTime<Utc>) -> Option<&Lease> {
        self.leases.get(id).filter(|lease| !lease.is_expired(now))
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryNegotiationStore {
    state: Arc<Mutex<StoreState>>,
    holder: String,
    lease_duration: Duration,
    clock: SharedClock,
}

impl Default for InMemoryNegotiationStore {
    fn default() -> Self {
        Self::new("in-memory", Duration::from_secs(60), Arc::new(SystemClock))
    }
}

impl InMemoryNegotiationStore {
    pub fn new(holder: impl Into<String>, lease_duration: Duration, clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            holder: holder.into(),
            lease_duration,
            clock,
        }
    }

    /// Handle onto the same records acting as a different lease holder
    pub fn with_holder(&self, holder: impl Into<String>) -> Self {
        Self {
            state: Arc::clone(&self.state),
            holder: holder.into(),
            lease_duration: self.lease_duration,
            clock: Arc::clone(&self.clock),
        }
    }

    /// Current live lease on `id`, if any
    pub fn lease(&self, id: &str) -> Option<Lease> {
        let now = self.clock.now();
        self.state.lock().live_lease(id, now).cloned()
    }

    pub fn is_leased(&self, id: &str) -> bool {
        self.lease(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn acquire(
        &self,
        state: &mut StoreState,
        id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Negotiation>> {
        let Some(entity) = state.entities.get(id).cloned() else {
            return Ok(None);
        };
        if let Some(lease) = state.live_lease(id, now) {
            return Err(StoreError::LeaseHeld {
                id: id.to_string(),
                holder: lease.leased_by.clone(),
            });
        }
        state.leases.insert(
            id.to_string(),
            Lease::new(&self.holder, now, self.lease_duration),
        );
        Ok(Some(entity))
    }

    fn ensure_releasable(
        &self,
        state: &StoreState,
        id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        match state.live_lease(id, now) {
            Some(lease) if lease.leased_by != self.holder => Err(StoreError::LeaseHeld {
                id: id.to_string(),
                holder: lease.leased_by.clone(),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl NegotiationStore for InMemoryNegotiationStore {
    fn lease_holder(&self) -> &str {
        &self.holder
    }

    #[instrument(skip(self), fields(holder = %self.holder))]
    async fn next_not_leased(
        &self,
        batch_size: usize,
        criteria: &Criteria,
    ) -> StoreResult<Vec<Negotiation>> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let mut candidates: Vec<Negotiation> = state
            .entities
            .values()
            .filter(|n| criteria.matches(n, now) && state.live_lease(n.id(), now).is_none())
            .cloned()
            .collect();
        candidates.sort_by_key(|n| n.state_timestamp());
        candidates.truncate(batch_size);

        for negotiation in &candidates {
            state.leases.insert(
                negotiation.id().to_string(),
                Lease::new(&self.holder, now, self.lease_duration),
            );
        }

        if !candidates.is_empty() {
            debug!(
                leased = candidates.len(),
                state = %criteria.state,
                "Leased negotiations for processing"
            );
        }

        Ok(candidates)
    }

    async fn save(&self, negotiation: &Negotiation) -> StoreResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.ensure_releasable(&state, negotiation.id(), now)?;
        if let Some(correlation_id) = negotiation.correlation_id() {
            let taken = state.entities.values().any(|other| {
                other.id() != negotiation.id()
                    && other.correlation_id() == Some(correlation_id)
                    && other.negotiation_type() == negotiation.negotiation_type()
            });
            if taken {
                return Err(StoreError::DuplicateCorrelation {
                    correlation_id: correlation_id.to_string(),
                    negotiation_type: negotiation.negotiation_type().to_string(),
                });
            }
        }

        state
            .entities
            .insert(negotiation.id().to_string(), negotiation.clone());
        state.leases.remove(negotiation.id());
        Ok(())
    }

    async fn break_lease(&self, id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.ensure_releasable(&state, id, now)?;
        state.leases.remove(id);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Negotiation>> {
        Ok(self.state.lock().entities.get(id).cloned())
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> StoreResult<Option<Negotiation>> {
        Ok(self
            .state
            .lock()
            .entities
            .values()
            .find(|n| n.correlation_id() == Some(correlation_id))
            .cloned())
    }

    async fn find_by_id_and_lease(&self, id: &str) -> StoreResult<Option<Negotiation>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.acquire(&mut state, id, now)
    }

    async fn find_by_correlation_id_and_lease(
        &self,
        correlation_id: &str,
    ) -> StoreResult<Option<Negotiation>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let id = state
            .entities
            .values()
            .find(|n| n.correlation_id() == Some(correlation_id))
            .map(|n| n.id().to_string());

        match id {
            Some(id) => self.acquire(&mut state, &id, now),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::models::{NegotiationType, NewNegotiation};
    use crate::state_machine::NegotiationState;

    fn store_with_clock() -> (InMemoryNegotiationStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store =
            InMemoryNegotiationStore::new("worker-a", Duration::from_secs(60), clock.clone());
        (store, clock)
    }

    fn negotiation(now: DateTime<Utc>) -> Negotiation {
        Negotiation::new(
            NewNegotiation {
                negotiation_type: Some(NegotiationType::Consumer),
                counter_party_id: "provider".into(),
                counter_party_address: "http://provider".into(),
                protocol: "dsp".into(),
                ..Default::default()
            },
            now,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_leased_entity_is_not_returned_twice() {
        let (store, clock) = store_with_clock();
        let entity = negotiation(clock.now());
        store.save(&entity).await.unwrap();

        let criteria = Criteria::new(NegotiationState::Initial);
        let first = store.next_not_leased(10, &criteria).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(store.is_leased(entity.id()));

        let other = store.with_holder("worker-b");
        assert!(other.next_not_leased(10, &criteria).await.unwrap().is_empty());

        store.save(&first[0]).await.unwrap();
        assert!(!store.is_leased(entity.id()));
        assert_eq!(other.next_not_leased(10, &criteria).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_lease_duration_keeps_entity_leased() {
        let clock = Arc::new(ManualClock::default());
        let lease_duration = Duration::from_millis(u64::MAX);
        let store = InMemoryNegotiationStore::new("worker-a", lease_duration, clock.clone());
        let entity = negotiation(clock.now());
        store.save(&entity).await.unwrap();

        let criteria = Criteria::new(NegotiationState::Initial);
        assert_eq!(store.next_not_leased(1, &criteria).await.unwrap().len(), 1);
        assert!(store.is_leased(entity.id()));

        clock.advance(Duration::from_secs(86_400 * 365));
        assert!(store.is_leased(entity.id()));
        let other = store.with_holder("worker-b");
        assert!(other.next_not_leased(1, &criteria).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_reacquired() {
        let (store, clock) = store_with_clock();
        let entity = negotiation(clock.now());
        store.save(&entity).await.unwrap();

        let criteria = Criteria::new(NegotiationState::Initial);
        assert_eq!(store.next_not_leased(1, &criteria).await.unwrap().len(), 1);

        let other = store.with_holder("worker-b");
        clock.advance(Duration::from_secs(61));
        let reacquired = other.next_not_leased(1, &criteria).await.unwrap();
        assert_eq!(reacquired.len(), 1);
        assert_eq!(store.lease(entity.id()).unwrap().leased_by, "worker-b");
    }

    #[tokio::test]
    async fn test_save_rejected_while_other_holder_leases() {
        let (store, clock) = store_with_clock();
        let entity = negotiation(clock.now());
        store.save(&entity).await.unwrap();

        let other = store.with_holder("worker-b");
        other.find_by_id_and_lease(entity.id()).await.unwrap().unwrap();

        let err = store.save(&entity).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseHeld { ref holder, .. } if holder == "worker-b"));
        assert!(store.break_lease(entity.id()).await.is_err());

        other.break_lease(entity.id()).await.unwrap();
        store.save(&entity).await.unwrap();
    }

    #[tokio::test]
    async fn test_find_and_lease_is_exclusive() {
        let (store, clock) = store_with_clock();
        let mut entity = negotiation(clock.now());
        entity.set_correlation_id("remote-pid").unwrap();
        store.save(&entity).await.unwrap();

        assert!(store
            .find_by_correlation_id_and_lease("remote-pid")
            .await
            .unwrap()
            .is_some());
        let err = store
            .with_holder("worker-b")
            .find_by_id_and_lease(entity.id())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseHeld { .. }));

        assert!(store.find_by_id_and_lease("missing").await.unwrap().is_none());
        assert!(store.find_by_correlation_id("remote-pid").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pending_and_backing_off_entities_are_skipped() {
        let (store, clock) = store_with_clock();
        let now = clock.now();

        let mut pending = negotiation(now);
        pending.set_pending(true, now);
        let mut backing_off = negotiation(now);
        backing_off.mark_retry(now + chrono::Duration::seconds(10), now);
        store.save(&pending).await.unwrap();
        store.save(&backing_off).await.unwrap();

        let criteria = Criteria::new(NegotiationState::Initial);
        assert!(store.next_not_leased(10, &criteria).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(10));
        let due = store.next_not_leased(10, &criteria).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id(), backing_off.id());
    }

    #[tokio::test]
    async fn test_criteria_type_filter() {
        let (store, clock) = store_with_clock();
        store.save(&negotiation(clock.now())).await.unwrap();

        let provider_criteria =
            Criteria::new(NegotiationState::Initial).with_type(NegotiationType::Provider);
        assert!(store.next_not_leased(10, &provider_criteria).await.unwrap().is_empty());

        let consumer_criteria =
            Criteria::new(NegotiationState::Initial).with_type(NegotiationType::Consumer);
        assert_eq!(store.next_not_leased(10, &consumer_criteria).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_record_for_same_correlation_is_rejected() {
        let (store, clock) = store_with_clock();
        let mut first = negotiation(clock.now());
        first.set_correlation_id("remote-pid").unwrap();
        store.save(&first).await.unwrap();

        let mut second = negotiation(clock.now());
        second.set_correlation_id("remote-pid").unwrap();
        match store.save(&second).await {
            Err(StoreError::DuplicateCorrelation { correlation_id, .. }) => {
                assert_eq!(correlation_id, "remote-pid")
            }
            other => panic!("unexpected save result: {other:?}"),
        }
        assert!(store.find_by_id(second.id()).await.unwrap().is_none());

        // the owning record can still be saved again
        store.save(&first).await.unwrap();
    }
}
