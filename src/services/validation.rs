//! Authorization of inbound protocol messages.
//!
//! Policy evaluation and identity verification live outside this crate; the
//! protocol service only sees the verified [`ClaimToken`] and a yes/no answer
//! with a reason.

use crate::models::{ContractAgreement, ContractOffer, Negotiation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Verified identity of the party that sent a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimToken {
    pub participant_id: String,
    #[serde(default)]
    pub claims: HashMap<String, Value>,
}

impl ClaimToken {
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            claims: HashMap::new(),
        }
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: Value) -> Self {
        self.claims.insert(key.into(), value);
        self
    }
}

pub type ValidationResult = Result<(), String>;

pub trait ContractValidationService: Send + Sync {
    /// May the sender request `offer`?
    fn validate_request(&self, claims: &ClaimToken, offer: &ContractOffer) -> ValidationResult;

    /// Is `agreement` acceptable given the sender's claims?
    fn validate_agreement(
        &self,
        claims: &ClaimToken,
        agreement: &ContractAgreement,
    ) -> ValidationResult;

    /// Is the sender the counter-party of `negotiation`?
    fn validate_counter_party(
        &self,
        claims: &ClaimToken,
        negotiation: &Negotiation,
    ) -> ValidationResult {
        if claims.participant_id == negotiation.counter_party_id() {
            Ok(())
        } else {
            Err(format!(
                "participant {} is not the counter-party of negotiation {}",
                claims.participant_id,
                negotiation.id()
            ))
        }
    }
}
