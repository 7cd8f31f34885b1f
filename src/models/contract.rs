use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Offer for an asset under a usage policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractOffer {
    pub id: String,
    pub asset_id: String,
    pub provider_id: String,
    /// Opaque policy document; evaluation happens outside this crate
    pub policy: Value,
}

impl ContractOffer {
    pub fn new(asset_id: impl Into<String>, provider_id: impl Into<String>, policy: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            asset_id: asset_id.into(),
            provider_id: provider_id.into(),
            policy,
        }
    }
}

/// Free-text reason carried into a negotiation's error detail
pub type TerminationReason = String;

/// Agreement produced by the provider from the last offer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractAgreement {
    pub id: String,
    pub provider_id: String,
    pub consumer_id: String,
    pub asset_id: String,
    pub policy: Value,
    /// Epoch seconds; set once when the agreement is first built
    pub contract_signing_date: i64,
}

impl ContractAgreement {
    pub fn from_offer(
        offer: &ContractOffer,
        consumer_id: impl Into<String>,
        signed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider_id: offer.provider_id.clone(),
            consumer_id: consumer_id.into(),
            asset_id: offer.asset_id.clone(),
            policy: offer.policy.clone(),
            contract_signing_date: signed_at.timestamp(),
        }
    }
}
