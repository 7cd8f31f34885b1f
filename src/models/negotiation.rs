//! # Negotiation Aggregate
//!
//! The [`Negotiation`] entity is the only shared mutable record of this crate.
//! Its state moves exclusively through the transition methods below, which
//! enforce the protocol graph and keep the bookkeeping fields
//! (`state_count`, `retry_count`, `last_sent_protocol_message_id`) coherent.

use super::contract::{ContractAgreement, ContractOffer};
use crate::error::{NegotiationError, NegotiationResult};
use crate::state_machine::NegotiationState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Which half of the protocol this process plays for an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationType {
    /// Consumer side, initiates the request
    Consumer,
    /// Provider side, responds to requests
    Provider,
}

impl fmt::Display for NegotiationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consumer => write!(f, "CONSUMER"),
            Self::Provider => write!(f, "PROVIDER"),
        }
    }
}

impl std::str::FromStr for NegotiationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONSUMER" => Ok(Self::Consumer),
            "PROVIDER" => Ok(Self::Provider),
            _ => Err(format!("Invalid negotiation type: {s}")),
        }
    }
}

/// Parameters for creating a negotiation
#[derive(Debug, Clone, Default)]
pub struct NewNegotiation {
    /// Explicit id; a random one is generated when absent
    pub id: Option<String>,
    pub correlation_id: Option<String>,
    pub negotiation_type: Option<NegotiationType>,
    pub counter_party_id: String,
    pub counter_party_address: String,
    pub protocol: String,
    pub contract_offer: Option<ContractOffer>,
    pub trace_context: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Negotiation {
    id: String,
    correlation_id: Option<String>,
    negotiation_type: NegotiationType,
    counter_party_id: String,
    counter_party_address: String,
    protocol: String,
    callback_address: Option<String>,
    state: NegotiationState,
    state_count: u32,
    state_timestamp: DateTime<Utc>,
    retry_count: u32,
    retry_at: Option<DateTime<Utc>>,
    last_sent_protocol_message_id: Option<String>,
    pending: bool,
    error_detail: Option<String>,
    contract_offers: Vec<ContractOffer>,
    contract_agreement: Option<ContractAgreement>,
    trace_context: HashMap<String, String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Negotiation {
    /// Create a negotiation in `INITIAL`, validating the routing data
    pub fn new(params: NewNegotiation, now: DateTime<Utc>) -> NegotiationResult<Self> {
        let negotiation_type = params
            .negotiation_type
            .ok_or_else(|| NegotiationError::Validation("negotiation type is required".into()))?;

        for (field, value) in [
            ("counter_party_id", &params.counter_party_id),
            ("counter_party_address", &params.counter_party_address),
            ("protocol", &params.protocol),
        ] {
            if value.trim().is_empty() {
                return Err(NegotiationError::Validation(format!(
                    "{field} must not be empty"
                )));
            }
        }

        if matches!(&params.id, Some(id) if id.trim().is_empty()) {
            return Err(NegotiationError::Validation("id must not be empty".into()));
        }

        Ok(Self {
            id: params.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            correlation_id: params.correlation_id,
            negotiation_type,
            counter_party_id: params.counter_party_id,
            counter_party_address: params.counter_party_address,
            protocol: params.protocol,
            callback_address: None,
            state: NegotiationState::Initial,
            state_count: 0,
            state_timestamp: now,
            retry_count: 0,
            retry_at: None,
            last_sent_protocol_message_id: None,
            pending: false,
            error_detail: None,
            contract_offers: params.contract_offer.into_iter().collect(),
            contract_agreement: None,
            trace_context: params.trace_context,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn negotiation_type(&self) -> NegotiationType {
        self.negotiation_type
    }

    pub fn counter_party_id(&self) -> &str {
        &self.counter_party_id
    }

    pub fn counter_party_address(&self) -> &str {
        &self.counter_party_address
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn callback_address(&self) -> Option<&str> {
        self.callback_address.as_deref()
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn state_count(&self) -> u32 {
        self.state_count
    }

    pub fn state_timestamp(&self) -> DateTime<Utc> {
        self.state_timestamp
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        self.retry_at
    }

    pub fn last_sent_protocol_message_id(&self) -> Option<&str> {
        self.last_sent_protocol_message_id.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    pub fn contract_offers(&self) -> &[ContractOffer] {
        &self.contract_offers
    }

    pub fn last_contract_offer(&self) -> Option<&ContractOffer> {
        self.contract_offers.last()
    }

    pub fn contract_agreement(&self) -> Option<&ContractAgreement> {
        self.contract_agreement.as_ref()
    }

    pub fn trace_context(&self) -> &HashMap<String, String> {
        &self.trace_context
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Whether the scheduler may pick this entity at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.pending && !self.state.is_terminal() && self.retry_at.map_or(true, |at| at <= now)
    }

    /// Move to `next` along the protocol graph.
    ///
    /// Starts a new logical step: the retry budget and the outbound message id
    /// are reset, and `state_count` is incremented.
    pub fn transition_to(
        &mut self,
        next: NegotiationState,
        now: DateTime<Utc>,
    ) -> NegotiationResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(NegotiationError::invalid_transition(self.state, next));
        }

        self.state = next;
        self.state_count += 1;
        self.state_timestamp = now;
        self.retry_count = 0;
        self.retry_at = None;
        self.last_sent_protocol_message_id = None;
        self.pending = false;
        self.updated_at = now;
        Ok(())
    }

    /// Terminate with an optional failure explanation
    pub fn transition_to_terminated(
        &mut self,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> NegotiationResult<()> {
        self.transition_to(NegotiationState::Terminated, now)?;
        if detail.is_some() {
            self.error_detail = detail;
        }
        Ok(())
    }

    /// Start sending a termination notice
    pub fn transition_to_terminating(
        &mut self,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> NegotiationResult<()> {
        self.transition_to(NegotiationState::Terminating, now)?;
        if detail.is_some() {
            self.error_detail = detail;
        }
        Ok(())
    }

    /// Record a failed attempt of the current step; state is left untouched
    pub fn mark_retry(&mut self, retry_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.retry_at = Some(retry_at);
        self.state_timestamp = now;
        self.updated_at = now;
    }

    /// Message id for the current step, generated on first use
    pub fn outbound_message_id(&mut self) -> String {
        self.last_sent_protocol_message_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone()
    }

    pub fn set_pending(&mut self, pending: bool, now: DateTime<Utc>) {
        self.pending = pending;
        self.updated_at = now;
    }

    /// Correlation id is assigned once; later differing values are rejected
    pub fn set_correlation_id(
        &mut self,
        correlation_id: impl Into<String>,
    ) -> NegotiationResult<()> {
        let correlation_id = correlation_id.into();
        match &self.correlation_id {
            Some(existing) if *existing != correlation_id => Err(NegotiationError::Conflict(format!(
                "negotiation {} already correlated with {existing}",
                self.id
            ))),
            _ => {
                self.correlation_id = Some(correlation_id);
                Ok(())
            }
        }
    }

    pub fn set_callback_address(&mut self, address: impl Into<String>) {
        self.callback_address = Some(address.into());
    }

    pub fn set_error_detail(&mut self, detail: impl Into<String>) {
        self.error_detail = Some(detail.into());
    }

    pub fn add_contract_offer(&mut self, offer: ContractOffer) {
        self.contract_offers.push(offer);
    }

    pub fn set_contract_agreement(&mut self, agreement: ContractAgreement) {
        self.contract_agreement = Some(agreement);
    }
}
