//! # Protocol Service
//!
//! Entry point for inbound protocol messages and local commands. This is the
//! reacting half of the protocol: the scheduler dispatches, the counter-party
//! receives the message here and records the new state.
//!
//! ## Result semantics
//!
//! Caller mistakes come back as a [`ServiceResult`] and never change
//! persisted state:
//! - `BadRequest`: validation or authorization failed
//! - `Conflict`: the negotiation is leased elsewhere or not in an eligible state
//! - `NotFound`: no negotiation matches
//!
//! Infrastructure failures (store unavailable, serialization) propagate as
//! `Err`. Every lookup leases the entity; paths that do not transition
//! release the lease with `break_lease`.

use super::validation::{ClaimToken, ContractValidationService};
use crate::error::{NegotiationError, NegotiationResult, StoreError};
use crate::logging::log_negotiation_operation;
use crate::models::{
    ContractAgreement, ContractOffer, Negotiation, NegotiationType, NewNegotiation,
    TerminationReason,
};
use crate::orchestration::TransitionContext;
use crate::state_machine::{NegotiationEvent, NegotiationState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceResult<T> {
    Ok(T),
    BadRequest(String),
    Conflict(String),
    NotFound(String),
}

impl<T> ServiceResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ServiceResult<U> {
        match self {
            Self::Ok(value) => ServiceResult::Ok(f(value)),
            Self::BadRequest(msg) => ServiceResult::BadRequest(msg),
            Self::Conflict(msg) => ServiceResult::Conflict(msg),
            Self::NotFound(msg) => ServiceResult::NotFound(msg),
        }
    }

    pub fn into_result(self) -> NegotiationResult<T> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::BadRequest(msg) => Err(NegotiationError::Validation(msg)),
            Self::Conflict(msg) => Err(NegotiationError::Conflict(msg)),
            Self::NotFound(msg) => Err(NegotiationError::NotFound(msg)),
        }
    }
}

/// Process ids carried by an inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIds {
    /// The sender's own negotiation id
    pub sender_pid: String,
    /// Our negotiation id, when the sender already knows it
    pub receiver_pid: Option<String>,
}

impl ProcessIds {
    pub fn new(sender_pid: impl Into<String>, receiver_pid: Option<String>) -> Self {
        Self {
            sender_pid: sender_pid.into(),
            receiver_pid,
        }
    }
}

/// Contract request or offer opening a negotiation on the receiving side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialMessage {
    pub sender_pid: String,
    pub callback_address: String,
    pub protocol: String,
    pub offer: ContractOffer,
    #[serde(default)]
    pub trace_context: HashMap<String, String>,
}

enum Lookup<'a> {
    Id(&'a str),
    Process(&'a ProcessIds),
}

impl fmt::Display for Lookup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Process(ids) => match &ids.receiver_pid {
                Some(receiver) => write!(f, "{receiver}"),
                None => write!(f, "correlation {}", ids.sender_pid),
            },
        }
    }
}

/// Expected shape of the negotiation an operation applies to
struct Eligibility {
    negotiation_type: Option<NegotiationType>,
    from: &'static [NegotiationState],
    to: NegotiationState,
}

pub struct NegotiationProtocolService {
    context: Arc<TransitionContext>,
    validation: Arc<dyn ContractValidationService>,
}

impl fmt::Debug for NegotiationProtocolService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationProtocolService")
            .field("context", &self.context)
            .finish()
    }
}

impl NegotiationProtocolService {
    pub fn new(
        context: Arc<TransitionContext>,
        validation: Arc<dyn ContractValidationService>,
    ) -> Self {
        Self { context, validation }
    }

    /// Start a consumer negotiation in INITIAL for the scheduler to pick up
    #[instrument(skip(self, params), fields(counter_party_id = %params.counter_party_id))]
    pub async fn initiate(
        &self,
        mut params: NewNegotiation,
    ) -> NegotiationResult<ServiceResult<Negotiation>> {
        if params.contract_offer.is_none() {
            return Ok(ServiceResult::BadRequest("a contract offer is required".into()));
        }
        params.negotiation_type = Some(NegotiationType::Consumer);

        let negotiation = match Negotiation::new(params, self.context.now()) {
            Ok(negotiation) => negotiation,
            Err(NegotiationError::Validation(msg)) => return Ok(ServiceResult::BadRequest(msg)),
            Err(e) => return Err(e),
        };

        self.context.store().save(&negotiation).await?;
        self.context
            .observable()
            .notify(NegotiationEvent::Initiated, &negotiation);

        log_negotiation_operation(
            "initiate",
            Some(negotiation.id()),
            Some("CONSUMER"),
            Some("INITIAL"),
            "created",
            None,
        );
        Ok(ServiceResult::Ok(negotiation))
    }

    /// Provider receives a contract request: a new negotiation in REQUESTED
    #[instrument(skip(self, claims, message), fields(consumer_pid = %message.sender_pid))]
    pub async fn notify_requested(
        &self,
        claims: &ClaimToken,
        message: InitialMessage,
    ) -> NegotiationResult<ServiceResult<Negotiation>> {
        if let Err(reason) = self.validation.validate_request(claims, &message.offer) {
            return Ok(ServiceResult::BadRequest(reason));
        }
        self.open_from_counter_party(
            claims,
            message,
            NegotiationType::Provider,
            NegotiationState::Requested,
        )
            .await
    }

    /// Consumer receives an offer. Opens a new negotiation when the provider
    /// starts with an offer, otherwise records the counter-offer.
    #[instrument(skip(self, claims, ids, offer), fields(provider_pid = %ids.sender_pid))]
    pub async fn notify_offered(
        &self,
        claims: &ClaimToken,
        ids: &ProcessIds,
        callback_address: &str,
        protocol: &str,
        offer: ContractOffer,
    ) -> NegotiationResult<ServiceResult<Negotiation>> {
        let opening = ids.receiver_pid.is_none()
            && self
                .context
                .store()
                .find_by_correlation_id(&ids.sender_pid)
                .await?
                .is_none();
        if opening {
            let message = InitialMessage {
                sender_pid: ids.sender_pid.clone(),
                callback_address: callback_address.to_string(),
                protocol: protocol.to_string(),
                offer,
                trace_context: HashMap::new(),
            };
            return self
                .open_from_counter_party(
                    claims,
                    message,
                    NegotiationType::Consumer,
                    NegotiationState::Offered,
                )
                .await;
        }

        self.update(
            Some(claims),
            Lookup::Process(ids),
            Eligibility {
                negotiation_type: Some(NegotiationType::Consumer),
                from: &[NegotiationState::Requested],
                to: NegotiationState::Offered,
            },
            |negotiation| {
                negotiation.add_contract_offer(offer);
                Ok(())
            },
        )
        .await
    }

    /// Provider learns the consumer accepted the last offer
    #[instrument(skip(self, claims, ids), fields(consumer_pid = %ids.sender_pid))]
    pub async fn notify_accepted(
        &self,
        claims: &ClaimToken,
        ids: &ProcessIds,
    ) -> NegotiationResult<ServiceResult<Negotiation>> {
        self.update(
            Some(claims),
            Lookup::Process(ids),
            Eligibility {
                negotiation_type: Some(NegotiationType::Provider),
                from: &[NegotiationState::Offered],
                to: NegotiationState::Accepted,
            },
            |_| Ok(()),
        )
        .await
    }

    /// Consumer receives the agreement
    #[instrument(skip(self, claims, ids, agreement), fields(provider_pid = %ids.sender_pid))]
    pub async fn notify_agreed(
        &self,
        claims: &ClaimToken,
        ids: &ProcessIds,
        agreement: ContractAgreement,
    ) -> NegotiationResult<ServiceResult<Negotiation>> {
        if let Err(reason) = self.validation.validate_agreement(claims, &agreement) {
            return Ok(ServiceResult::BadRequest(reason));
        }
        self.update(
            Some(claims),
            Lookup::Process(ids),
            Eligibility {
                negotiation_type: Some(NegotiationType::Consumer),
                from: &[
                    NegotiationState::Requested,
                    NegotiationState::Offered,
                    NegotiationState::Accepted,
                ],
                to: NegotiationState::Agreed,
            },
            |negotiation| {
                negotiation.set_contract_agreement(agreement);
                Ok(())
            },
        )
        .await
    }

    /// Provider learns the consumer verified the agreement
    #[instrument(skip(self, claims, ids), fields(consumer_pid = %ids.sender_pid))]
    pub async fn notify_verified(
        &self,
        claims: &ClaimToken,
        ids: &ProcessIds,
    ) -> NegotiationResult<ServiceResult<Negotiation>> {
        self.update(
            Some(claims),
            Lookup::Process(ids),
            Eligibility {
                negotiation_type: Some(NegotiationType::Provider),
                from: &[NegotiationState::Agreed],
                to: NegotiationState::Verified,
            },
            |_| Ok(()),
        )
        .await
    }

    /// Consumer learns the provider finalized
    #[instrument(skip(self, claims, ids), fields(provider_pid = %ids.sender_pid))]
    pub async fn notify_finalized(
        &self,
        claims: &ClaimToken,
        ids: &ProcessIds,
    ) -> NegotiationResult<ServiceResult<Negotiation>> {
        self.update(
            Some(claims),
            Lookup::Process(ids),
            Eligibility {
                negotiation_type: Some(NegotiationType::Consumer),
                from: &[NegotiationState::Verified],
                to: NegotiationState::Finalized,
            },
            |_| Ok(()),
        )
        .await
    }

    /// Either side learns the counter-party terminated
    #[instrument(skip(self, claims, ids, reason), fields(sender_pid = %ids.sender_pid))]
    pub async fn notify_terminated(
        &self,
        claims: &ClaimToken,
        ids: &ProcessIds,
        reason: Option<TerminationReason>,
    ) -> NegotiationResult<ServiceResult<Negotiation>> {
        self.update(
            Some(claims),
            Lookup::Process(ids),
            Eligibility {
                negotiation_type: None,
                from: NON_TERMINAL,
                to: NegotiationState::Terminated,
            },
            |negotiation| {
                if let Some(reason) = reason {
                    negotiation.set_error_detail(reason);
                }
                Ok(())
            },
        )
        .await
    }

    /// Consumer accepts the provider's last offer
    #[instrument(skip(self))]
    pub async fn accept(&self, id: &str) -> NegotiationResult<ServiceResult<Negotiation>> {
        self.update(
            None,
            Lookup::Id(id),
            Eligibility {
                negotiation_type: Some(NegotiationType::Consumer),
                from: &[NegotiationState::Offered],
                to: NegotiationState::Accepting,
            },
            |_| Ok(()),
        )
        .await
    }

    /// Abort locally; the scheduler sends the termination notice
    #[instrument(skip(self, reason))]
    pub async fn terminate(
        &self,
        id: &str,
        reason: impl Into<String>,
    ) -> NegotiationResult<ServiceResult<Negotiation>> {
        let reason = reason.into();
        let from: &[NegotiationState] = &NON_TERMINAL[..NON_TERMINAL.len() - 1];
        self.update(
            None,
            Lookup::Id(id),
            Eligibility {
                negotiation_type: None,
                from,
                to: NegotiationState::Terminating,
            },
            |negotiation| {
                negotiation.set_error_detail(reason);
                Ok(())
            },
        )
        .await
    }

    pub async fn find_by_id(&self, id: &str) -> NegotiationResult<ServiceResult<Negotiation>> {
        Ok(match self.context.store().find_by_id(id).await? {
            Some(negotiation) => ServiceResult::Ok(negotiation),
            None => ServiceResult::NotFound(format!("negotiation {id} not found")),
        })
    }

    async fn open_from_counter_party(
        &self,
        claims: &ClaimToken,
        message: InitialMessage,
        negotiation_type: NegotiationType,
        to: NegotiationState,
    ) -> NegotiationResult<ServiceResult<Negotiation>> {
        if let Some(existing) = self
            .redelivered(claims, &message.sender_pid, negotiation_type)
            .await?
        {
            return Ok(existing);
        }

        let params = NewNegotiation {
            correlation_id: Some(message.sender_pid.clone()),
            negotiation_type: Some(negotiation_type),
            counter_party_id: claims.participant_id.clone(),
            counter_party_address: message.callback_address,
            protocol: message.protocol,
            contract_offer: Some(message.offer),
            trace_context: message.trace_context,
            ..Default::default()
        };
        let mut negotiation = match Negotiation::new(params, self.context.now()) {
            Ok(negotiation) => negotiation,
            Err(NegotiationError::Validation(msg)) => return Ok(ServiceResult::BadRequest(msg)),
            Err(e) => return Err(e),
        };

        match self.context.transition(&mut negotiation, to).await {
            Ok(()) => {}
            // a concurrent delivery of the same message created the record first
            Err(NegotiationError::Store(StoreError::DuplicateCorrelation { .. })) => {
                let sender_pid = &message.sender_pid;
                return match self.redelivered(claims, sender_pid, negotiation_type).await? {
                    Some(existing) => Ok(existing),
                    None => Err(NegotiationError::Conflict(format!(
                        "process id {sender_pid} was claimed concurrently"
                    ))),
                };
            }
            Err(e) => return Err(e),
        }
        info!(
            negotiation_id = negotiation.id(),
            negotiation_type = %negotiation_type,
            state = %negotiation.state(),
            "Negotiation opened by counter-party"
        );
        Ok(ServiceResult::Ok(negotiation))
    }

    /// Outcome for an opening message whose process id is already stored
    async fn redelivered(
        &self,
        claims: &ClaimToken,
        sender_pid: &str,
        negotiation_type: NegotiationType,
    ) -> NegotiationResult<Option<ServiceResult<Negotiation>>> {
        let Some(existing) = self.context.store().find_by_correlation_id(sender_pid).await? else {
            return Ok(None);
        };
        if existing.negotiation_type() == negotiation_type
            && existing.counter_party_id() == claims.participant_id
        {
            debug!(negotiation_id = existing.id(), "Opening message already processed");
            return Ok(Some(ServiceResult::Ok(existing)));
        }
        Ok(Some(ServiceResult::Conflict(format!(
            "process id {sender_pid} is already in use"
        ))))
    }

    /// Lease, check, mutate, transition. Every rejection releases the lease.
    async fn update<F>(
        &self,
        claims: Option<&ClaimToken>,
        lookup: Lookup<'_>,
        eligibility: Eligibility,
        mutate: F,
    ) -> NegotiationResult<ServiceResult<Negotiation>>
    where
        F: FnOnce(&mut Negotiation) -> Result<(), String> + Send,
    {
        let store = self.context.store();
        let leased = match &lookup {
            Lookup::Id(id) => store.find_by_id_and_lease(id).await,
            Lookup::Process(ids) => match &ids.receiver_pid {
                Some(receiver) => store.find_by_id_and_lease(receiver).await,
                None => store.find_by_correlation_id_and_lease(&ids.sender_pid).await,
            },
        };

        let mut negotiation = match leased {
            Ok(Some(negotiation)) => negotiation,
            Ok(None) => {
                return Ok(ServiceResult::NotFound(format!("negotiation {lookup} not found")))
            }
            Err(StoreError::LeaseHeld { id, .. }) => {
                return Ok(ServiceResult::Conflict(format!("negotiation {id} is being processed")))
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(rejection) = self.check(claims, &lookup, &eligibility, &mut negotiation) {
            store.break_lease(negotiation.id()).await?;
            return Ok(rejection);
        }

        if let Err(reason) = mutate(&mut negotiation) {
            store.break_lease(negotiation.id()).await?;
            return Ok(ServiceResult::BadRequest(reason));
        }

        if let Err(e) = self.context.transition(&mut negotiation, eligibility.to).await {
            store.break_lease(negotiation.id()).await?;
            return Err(e);
        }
        Ok(ServiceResult::Ok(negotiation))
    }

    fn check(
        &self,
        claims: Option<&ClaimToken>,
        lookup: &Lookup<'_>,
        eligibility: &Eligibility,
        negotiation: &mut Negotiation,
    ) -> Option<ServiceResult<Negotiation>> {
        if let Some(claims) = claims {
            if let Err(reason) = self.validation.validate_counter_party(claims, negotiation) {
                return Some(ServiceResult::BadRequest(reason));
            }
        }

        if eligibility
            .negotiation_type
            .is_some_and(|t| t != negotiation.negotiation_type())
        {
            return Some(ServiceResult::Conflict(format!(
                "negotiation {} is a {} negotiation",
                negotiation.id(),
                negotiation.negotiation_type()
            )));
        }

        if !eligibility.from.contains(&negotiation.state()) {
            return Some(ServiceResult::Conflict(format!(
                "cannot move negotiation {} from {} to {}",
                negotiation.id(),
                negotiation.state(),
                eligibility.to
            )));
        }

        // First message carrying both ids links the records
        if let Lookup::Process(ids) = lookup {
            if ids.receiver_pid.is_some() {
                if let Err(e) = negotiation.set_correlation_id(ids.sender_pid.clone()) {
                    return Some(ServiceResult::Conflict(e.to_string()));
                }
            }
        }
        None
    }
}

/// Every state except FINALIZED and TERMINATED, TERMINATING last
const NON_TERMINAL: &[NegotiationState] = &[
    NegotiationState::Initial,
    NegotiationState::Requesting,
    NegotiationState::Requested,
    NegotiationState::Offering,
    NegotiationState::Offered,
    NegotiationState::Accepting,
    NegotiationState::Accepted,
    NegotiationState::Agreeing,
    NegotiationState::Agreed,
    NegotiationState::Verifying,
    NegotiationState::Verified,
    NegotiationState::Finalizing,
    NegotiationState::Terminating,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use crate::dispatch::{
        NegotiationAck, RemoteMessage, RemoteMessageDispatcher, StaticCallbackResolver,
    };
    use crate::error::DispatchError;
    use crate::retry::RetryProcessor;
    use crate::error::StoreResult;
    use crate::store::{Criteria, InMemoryNegotiationStore, NegotiationStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Dispatcher;

    #[async_trait]
    impl RemoteMessageDispatcher for Dispatcher {
        async fn dispatch(&self, _message: RemoteMessage) -> Result<NegotiationAck, DispatchError> {
            Ok(NegotiationAck::default())
        }
    }

    struct AssetPolicy;

    impl ContractValidationService for AssetPolicy {
        fn validate_request(
            &self,
            _claims: &ClaimToken,
            offer: &ContractOffer,
        ) -> Result<(), String> {
            if offer.asset_id == "forbidden" {
                Err("asset not offered".into())
            } else {
                Ok(())
            }
        }

        fn validate_agreement(
            &self,
            claims: &ClaimToken,
            agreement: &ContractAgreement,
        ) -> Result<(), String> {
            if agreement.provider_id == claims.participant_id {
                Ok(())
            } else {
                Err("agreement not issued by sender".into())
            }
        }
    }

    /// Misses the next correlation lookup, as a delivery racing another would
    struct RacingStore {
        inner: InMemoryNegotiationStore,
        miss_next_lookup: AtomicBool,
    }

    #[async_trait]
    impl NegotiationStore for RacingStore {
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
            if self.miss_next_lookup.swap(false, Ordering::SeqCst) {
                return Ok(None);
            }
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

    fn service() -> (NegotiationProtocolService, InMemoryNegotiationStore) {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryNegotiationStore::new("svc", Duration::from_secs(60), clock.clone());
        (service_over(Arc::new(store.clone()), clock), store)
    }

    fn service_over(
        store: Arc<dyn NegotiationStore>,
        clock: Arc<ManualClock>,
    ) -> NegotiationProtocolService {
        let context = TransitionContext::new(
            store,
            Arc::new(Dispatcher),
            Arc::new(StaticCallbackResolver::new()),
            RetryProcessor::new(RetryConfig::default(), Duration::from_secs(1)),
            clock,
        );
        NegotiationProtocolService::new(Arc::new(context), Arc::new(AssetPolicy))
    }

    fn request(asset: &str) -> InitialMessage {
        InitialMessage {
            sender_pid: "consumer-pid".into(),
            callback_address: "http://consumer/callback".into(),
            protocol: "dsp".into(),
            offer: ContractOffer::new(asset, "provider", serde_json::json!({})),
            trace_context: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_initiate_requires_offer() {
        let (service, store) = service();
        let result = service
            .initiate(NewNegotiation {
                counter_party_id: "provider".into(),
                counter_party_address: "http://provider".into(),
                protocol: "dsp".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(matches!(result, ServiceResult::BadRequest(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_notify_requested_creates_provider_negotiation() {
        let (service, store) = service();
        let claims = ClaimToken::new("consumer");

        let negotiation = service
            .notify_requested(&claims, request("asset-1"))
            .await
            .unwrap()
            .ok()
            .unwrap();

        assert_eq!(negotiation.negotiation_type(), NegotiationType::Provider);
        assert_eq!(negotiation.state(), NegotiationState::Requested);
        assert_eq!(negotiation.correlation_id(), Some("consumer-pid"));
        assert_eq!(negotiation.counter_party_address(), "http://consumer/callback");
        assert_eq!(store.len(), 1);

        // redelivery is idempotent
        let again = service
            .notify_requested(&claims, request("asset-1"))
            .await
            .unwrap();
        assert_eq!(again.ok().map(|n| n.id().to_string()), Some(negotiation.id().to_string()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_request_is_not_persisted() {
        let (service, store) = service();
        let result = service
            .notify_requested(&ClaimToken::new("consumer"), request("forbidden"))
            .await
            .unwrap();
        assert_eq!(result, ServiceResult::BadRequest("asset not offered".into()));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_ineligible_state_conflicts_and_releases_lease() {
        let (service, store) = service();
        let claims = ClaimToken::new("consumer");
        let negotiation = service
            .notify_requested(&claims, request("asset-1"))
            .await
            .unwrap()
            .ok()
            .unwrap();

        // REQUESTED provider negotiation cannot be verified yet
        let ids = ProcessIds::new("consumer-pid", Some(negotiation.id().to_string()));
        let result = service.notify_verified(&claims, &ids).await.unwrap();
        assert!(matches!(result, ServiceResult::Conflict(_)));
        assert!(!store.is_leased(negotiation.id()));

        let stored = store.find_by_id(negotiation.id()).await.unwrap().unwrap();
        assert_eq!(stored, negotiation);
    }

    #[tokio::test]
    async fn test_wrong_sender_is_bad_request() {
        let (service, store) = service();
        let negotiation = service
            .notify_requested(&ClaimToken::new("consumer"), request("asset-1"))
            .await
            .unwrap()
            .ok()
            .unwrap();

        let ids = ProcessIds::new("consumer-pid", None);
        let result = service
            .notify_terminated(&ClaimToken::new("intruder"), &ids, None)
            .await
            .unwrap();
        assert!(matches!(result, ServiceResult::BadRequest(_)));
        assert!(!store.is_leased(negotiation.id()));
    }

    #[tokio::test]
    async fn test_unknown_negotiation_not_found() {
        let (service, _store) = service();
        assert!(matches!(
            service.accept("missing").await.unwrap(),
            ServiceResult::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_leased_negotiation_conflicts() {
        let (service, store) = service();
        let negotiation = service
            .notify_requested(&ClaimToken::new("consumer"), request("asset-1"))
            .await
            .unwrap()
            .ok()
            .unwrap();

        let worker = store.with_holder("worker");
        worker.find_by_id_and_lease(negotiation.id()).await.unwrap();

        let result = service.terminate(negotiation.id(), "operator abort").await.unwrap();
        assert!(matches!(result, ServiceResult::Conflict(_)));
    }

    #[tokio::test]
    async fn test_terminate_moves_to_terminating() {
        let (service, _store) = service();
        let negotiation = service
            .notify_requested(&ClaimToken::new("consumer"), request("asset-1"))
            .await
            .unwrap()
            .ok()
            .unwrap();

        let terminated = service
            .terminate(negotiation.id(), "operator abort")
            .await
            .unwrap()
            .ok()
            .unwrap();
        assert_eq!(terminated.state(), NegotiationState::Terminating);
        assert_eq!(terminated.error_detail(), Some("operator abort"));

        // already terminating
        assert!(matches!(
            service.terminate(negotiation.id(), "again").await.unwrap(),
            ServiceResult::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_opening_deliveries_share_one_record() {
        let clock = Arc::new(ManualClock::default());
        let inner = InMemoryNegotiationStore::new("svc", Duration::from_secs(60), clock.clone());
        let store = Arc::new(RacingStore {
            inner: inner.clone(),
            miss_next_lookup: AtomicBool::new(false),
        });
        let service = service_over(store.clone(), clock);
        let claims = ClaimToken::new("consumer");

        let first = service
            .notify_requested(&claims, request("asset-1"))
            .await
            .unwrap()
            .ok()
            .unwrap();

        // the second delivery checked before the first one was stored
        store.miss_next_lookup.store(true, Ordering::SeqCst);
        let second = service
            .notify_requested(&claims, request("asset-1"))
            .await
            .unwrap()
            .ok()
            .unwrap();

        assert_eq!(second.id(), first.id());
        assert_eq!(inner.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_opening_from_other_sender_conflicts() {
        let clock = Arc::new(ManualClock::default());
        let inner = InMemoryNegotiationStore::new("svc", Duration::from_secs(60), clock.clone());
        let store = Arc::new(RacingStore {
            inner: inner.clone(),
            miss_next_lookup: AtomicBool::new(false),
        });
        let service = service_over(store.clone(), clock);

        service
            .notify_requested(&ClaimToken::new("consumer"), request("asset-1"))
            .await
            .unwrap()
            .ok()
            .unwrap();

        store.miss_next_lookup.store(true, Ordering::SeqCst);
        let result = service
            .notify_requested(&ClaimToken::new("intruder"), request("asset-1"))
            .await
            .unwrap();

        assert!(matches!(result, ServiceResult::Conflict(_)));
        assert_eq!(inner.len(), 1);
    }
}
