use super::states::NegotiationState;
use serde::{Deserialize, Serialize};

/// Named lifecycle events emitted after a negotiation reaches a milestone state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationEvent {
    Initiated,
    Requested,
    Offered,
    Accepted,
    Agreed,
    Verified,
    Finalized,
    Terminated,
}

impl NegotiationEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Requested => "requested",
            Self::Offered => "offered",
            Self::Accepted => "accepted",
            Self::Agreed => "agreed",
            Self::Verified => "verified",
            Self::Finalized => "finalized",
            Self::Terminated => "terminated",
        }
    }

    /// Fully qualified event name used by the event publisher
    pub fn event_name(&self) -> String {
        format!("negotiation.{}", self.event_type())
    }

    /// Event fired when an entity enters `state`, if any
    pub fn for_state(state: NegotiationState) -> Option<Self> {
        match state {
            NegotiationState::Initial => Some(Self::Initiated),
            NegotiationState::Requested => Some(Self::Requested),
            NegotiationState::Offered => Some(Self::Offered),
            NegotiationState::Accepted => Some(Self::Accepted),
            NegotiationState::Agreed => Some(Self::Agreed),
            NegotiationState::Verified => Some(Self::Verified),
            NegotiationState::Finalized => Some(Self::Finalized),
            NegotiationState::Terminated => Some(Self::Terminated),
            _ => None,
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Terminated)
    }
}
