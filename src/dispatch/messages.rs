use crate::models::{ContractAgreement, ContractOffer, Negotiation, TerminationReason};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Event kinds carried by a negotiation event message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationEventType {
    Accepted,
    Finalized,
}

/// Protocol payload of an outbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProtocolMessageBody {
    ContractRequest {
        offer: ContractOffer,
        callback_address: String,
    },
    ContractOffer {
        offer: ContractOffer,
        callback_address: String,
    },
    NegotiationEvent {
        event_type: NegotiationEventType,
    },
    ContractAgreement {
        agreement: ContractAgreement,
    },
    AgreementVerification,
    Termination {
        reason: Option<TerminationReason>,
    },
}

impl ProtocolMessageBody {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::ContractRequest { .. } => "contract_request",
            Self::ContractOffer { .. } => "contract_offer",
            Self::NegotiationEvent {
                event_type: NegotiationEventType::Accepted,
            } => "negotiation_event_accepted",
            Self::NegotiationEvent {
                event_type: NegotiationEventType::Finalized,
            } => "negotiation_event_finalized",
            Self::ContractAgreement { .. } => "contract_agreement",
            Self::AgreementVerification => "agreement_verification",
            Self::Termination { .. } => "termination",
        }
    }
}

/// Outbound protocol message addressed to the counter-party
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    /// Stable across retries of the same step
    pub id: String,
    /// Sender's negotiation id
    pub process_id: String,
    /// Receiver's negotiation id, once known
    pub counter_party_process_id: Option<String>,
    pub counter_party_id: String,
    pub counter_party_address: String,
    pub protocol: String,
    pub trace_context: HashMap<String, String>,
    pub body: ProtocolMessageBody,
}

impl RemoteMessage {
    /// Address `body` to the counter-party of `negotiation` under `message_id`
    pub fn for_negotiation(
        negotiation: &Negotiation,
        message_id: String,
        body: ProtocolMessageBody,
    ) -> Self {
        Self {
            id: message_id,
            process_id: negotiation.id().to_string(),
            counter_party_process_id: negotiation.correlation_id().map(str::to_string),
            counter_party_id: negotiation.counter_party_id().to_string(),
            counter_party_address: negotiation.counter_party_address().to_string(),
            protocol: negotiation.protocol().to_string(),
            trace_context: negotiation.trace_context().clone(),
            body,
        }
    }
}

/// Acknowledgement returned by the counter-party
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NegotiationAck {
    /// The counter-party's own negotiation id
    pub process_id: Option<String>,
}

impl NegotiationAck {
    pub fn with_process_id(process_id: impl Into<String>) -> Self {
        Self {
            process_id: Some(process_id.into()),
        }
    }
}
