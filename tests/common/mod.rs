//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use negotiation_core::clock::{Clock, ManualClock};
use negotiation_core::config::{RetryConfig, StateMachineConfig};
use negotiation_core::dispatch::{
    NegotiationAck, RemoteMessage, RemoteMessageDispatcher, StaticCallbackResolver,
};
use negotiation_core::error::{DispatchError, StoreResult};
use negotiation_core::events::{NegotiationListener, NegotiationObservable};
use negotiation_core::models::{ContractOffer, Negotiation, NegotiationType, NewNegotiation};
use negotiation_core::orchestration::{RoleDescriptor, StateMachineManager, TransitionContext};
use negotiation_core::retry::RetryProcessor;
use negotiation_core::state_machine::NegotiationState;
use negotiation_core::store::{Criteria, InMemoryNegotiationStore, NegotiationStore};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub const PROTOCOL: &str = "dataspace-protocol-http";
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Ordered log shared by listeners and the store wrapper
pub type EventLog = Arc<Mutex<Vec<String>>>;

/// Dispatcher answering from a script, then with a fallback response
#[derive(Debug)]
pub struct ScriptedDispatcher {
    script: Mutex<VecDeque<Result<NegotiationAck, DispatchError>>>,
    fallback: Result<NegotiationAck, DispatchError>,
    sent: Mutex<Vec<RemoteMessage>>,
}

impl ScriptedDispatcher {
    pub fn succeeding() -> Self {
        Self::with_fallback(Ok(NegotiationAck::default()))
    }

    pub fn failing() -> Self {
        Self::with_fallback(Err(unreachable_error()))
    }

    pub fn with_fallback(fallback: Result<NegotiationAck, DispatchError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, response: Result<NegotiationAck, DispatchError>) -> Self {
        self.script.lock().push_back(response);
        self
    }

    pub fn sent(&self) -> Vec<RemoteMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl RemoteMessageDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, message: RemoteMessage) -> Result<NegotiationAck, DispatchError> {
        self.sent.lock().push(message);
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

pub fn unreachable_error() -> DispatchError {
    DispatchError::Unreachable {
        address: "http://provider/dsp".to_string(),
        reason: "connection refused".to_string(),
    }
}

/// Listener writing every hook into an [`EventLog`]
pub struct RecordingListener {
    log: EventLog,
}

impl RecordingListener {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }

    fn push(&self, entry: String) {
        self.log.lock().push(entry);
    }
}

impl NegotiationListener for RecordingListener {
    fn pre_transition(&self, _negotiation: &Negotiation, to: NegotiationState) {
        self.push(format!("pre:{to}"));
    }

    fn post_transition(&self, negotiation: &Negotiation, _from: NegotiationState) {
        self.push(format!("post:{}", negotiation.state()));
    }

    fn initiated(&self, _negotiation: &Negotiation) {
        self.push("initiated".to_string());
    }

    fn requested(&self, _negotiation: &Negotiation) {
        self.push("requested".to_string());
    }

    fn agreed(&self, _negotiation: &Negotiation) {
        self.push("agreed".to_string());
    }

    fn finalized(&self, _negotiation: &Negotiation) {
        self.push("finalized".to_string());
    }

    fn terminated(&self, _negotiation: &Negotiation) {
        self.push("terminated".to_string());
    }

    fn failed(&self, _negotiation: &Negotiation, error: &str) {
        self.push(format!("failed:{error}"));
    }
}

/// Store wrapper that logs every save
#[derive(Debug, Clone)]
pub struct RecordingStore {
    inner: InMemoryNegotiationStore,
    log: EventLog,
}

impl RecordingStore {
    pub fn new(inner: InMemoryNegotiationStore, log: EventLog) -> Self {
        Self { inner, log }
    }

    pub fn saves(&self) -> usize {
        self.log.lock().iter().filter(|e| e.starts_with("save:")).count()
    }
}

#[async_trait]
impl NegotiationStore for RecordingStore {
    fn lease_holder(&self) -> &str {
        self.inner.lease_holder()
    }

    async fn next_not_leased(
        &self,
        batch_size: usize,
        criteria: &Criteria,
    ) -> StoreResult<Vec<Negotiation>> {
        self.inner.next_not_leased(batch_size, criteria).await
    }

    async fn save(&self, negotiation: &Negotiation) -> StoreResult<()> {
        self.log.lock().push(format!("save:{}", negotiation.state()));
        self.inner.save(negotiation).await
    }

    async fn break_lease(&self, id: &str) -> StoreResult<()> {
        self.inner.break_lease(id).await
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Negotiation>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> StoreResult<Option<Negotiation>> {
        self.inner.find_by_correlation_id(correlation_id).await
    }

    async fn find_by_id_and_lease(&self, id: &str) -> StoreResult<Option<Negotiation>> {
        self.inner.find_by_id_and_lease(id).await
    }

    async fn find_by_correlation_id_and_lease(
        &self,
        correlation_id: &str,
    ) -> StoreResult<Option<Negotiation>> {
        self.inner.find_by_correlation_id_and_lease(correlation_id).await
    }
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()))
}

pub fn offer() -> ContractOffer {
    ContractOffer::new(
        "asset-1",
        "provider",
        serde_json::json!({ "permission": [{ "action": "use" }] }),
    )
}

pub fn new_negotiation(negotiation_type: NegotiationType, clock: &ManualClock) -> Negotiation {
    Negotiation::new(
        NewNegotiation {
            negotiation_type: Some(negotiation_type),
            counter_party_id: "provider".to_string(),
            counter_party_address: "http://provider/dsp".to_string(),
            protocol: PROTOCOL.to_string(),
            contract_offer: Some(offer()),
            ..Default::default()
        },
        clock.now(),
    )
    .unwrap()
}

/// One role's scheduler wired to in-memory collaborators
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: RecordingStore,
    pub dispatcher: Arc<ScriptedDispatcher>,
    pub log: EventLog,
    pub manager: StateMachineManager,
}

impl Harness {
    pub fn new(role: RoleDescriptor, dispatcher: ScriptedDispatcher, max_attempts: u32) -> Self {
        let clock = manual_clock();
        let log: EventLog = Arc::default();
        let store = RecordingStore::new(
            InMemoryNegotiationStore::new("worker-1", Duration::from_secs(60), clock.clone()),
            log.clone(),
        );
        let dispatcher = Arc::new(dispatcher);

        let context = TransitionContext::new(
            Arc::new(store.clone()),
            dispatcher.clone(),
            Arc::new(
                StaticCallbackResolver::new().with_address(PROTOCOL, "http://consumer/callback"),
            ),
            RetryProcessor::new(
                RetryConfig::fixed(max_attempts, RETRY_DELAY),
                Duration::from_secs(5),
            ),
            clock.clone(),
        )
        .with_observable(
            NegotiationObservable::new()
                .with_listener(Arc::new(RecordingListener::new(log.clone()))),
        );

        let manager = StateMachineManager::new(role, Arc::new(context), &state_machine_config());

        Self {
            clock,
            store,
            dispatcher,
            log,
            manager,
        }
    }

    pub async fn seed(&self, negotiation: &Negotiation) {
        self.store.save(negotiation).await.unwrap();
        self.log.lock().clear();
    }

    pub async fn load(&self, id: &str) -> Negotiation {
        self.store.find_by_id(id).await.unwrap().unwrap()
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Advance past the retry backoff
    pub fn wait_out_backoff(&self) {
        self.clock.advance(RETRY_DELAY);
    }
}

pub fn state_machine_config() -> StateMachineConfig {
    StateMachineConfig {
        batch_size: 10,
        poll_interval_ms: 10,
        lease_duration_ms: 60_000,
    }
}
