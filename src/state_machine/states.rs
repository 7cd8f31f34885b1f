use serde::{Deserialize, Serialize};
use std::fmt;

/// Negotiation protocol states shared by both roles
///
/// Each state carries a numeric code; every allowed transition moves to a
/// strictly higher code, which is what keeps the graph acyclic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationState {
    /// Created locally, nothing sent yet
    Initial,
    /// Consumer is sending its contract request
    Requesting,
    /// Request delivered (consumer) or received (provider)
    Requested,
    /// Provider is sending an offer
    Offering,
    /// Offer delivered (provider) or received (consumer)
    Offered,
    /// Consumer is sending its acceptance
    Accepting,
    /// Acceptance delivered (consumer) or received (provider)
    Accepted,
    /// Provider is sending the agreement
    Agreeing,
    /// Agreement delivered (provider) or received (consumer)
    Agreed,
    /// Consumer is sending the agreement verification
    Verifying,
    /// Verification delivered (consumer) or received (provider)
    Verified,
    /// Provider is sending the finalization event
    Finalizing,
    /// Negotiation completed with an agreement
    Finalized,
    /// A termination notice is being sent
    Terminating,
    /// Negotiation aborted
    Terminated,
}

impl NegotiationState {
    pub const ALL: [NegotiationState; 15] = [
        Self::Initial,
        Self::Requesting,
        Self::Requested,
        Self::Offering,
        Self::Offered,
        Self::Accepting,
        Self::Accepted,
        Self::Agreeing,
        Self::Agreed,
        Self::Verifying,
        Self::Verified,
        Self::Finalizing,
        Self::Finalized,
        Self::Terminating,
        Self::Terminated,
    ];

    /// Numeric state code as persisted by the store
    pub fn code(&self) -> i32 {
        match self {
            Self::Initial => 50,
            Self::Requesting => 100,
            Self::Requested => 200,
            Self::Offering => 300,
            Self::Offered => 400,
            Self::Accepting => 700,
            Self::Accepted => 800,
            Self::Agreeing => 825,
            Self::Agreed => 850,
            Self::Verifying => 1050,
            Self::Verified => 1100,
            Self::Finalizing => 1150,
            Self::Finalized => 1200,
            Self::Terminating => 1300,
            Self::Terminated => 1400,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.code() == code)
    }

    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Terminated)
    }

    /// Whether `self -> next` is an edge of the protocol graph
    pub fn can_transition_to(&self, next: NegotiationState) -> bool {
        use NegotiationState::*;

        if self.is_terminal() {
            return false;
        }

        // Abort path
        if matches!(next, Terminating | Terminated) {
            return *self != Terminating || next == Terminated;
        }

        matches!(
            (self, next),
            (Initial, Requesting)
                | (Initial, Offering)
                | (Initial, Requested)
                | (Initial, Offered)
                | (Requesting, Requested)
                | (Requested, Offering)
                | (Requested, Offered)
                | (Requested, Agreeing)
                | (Requested, Agreed)
                | (Offering, Offered)
                | (Offered, Accepting)
                | (Offered, Accepted)
                | (Offered, Agreeing)
                | (Offered, Agreed)
                | (Accepting, Accepted)
                | (Accepted, Agreeing)
                | (Accepted, Agreed)
                | (Agreeing, Agreed)
                | (Agreed, Verifying)
                | (Agreed, Verified)
                | (Verifying, Verified)
                | (Verified, Finalizing)
                | (Verified, Finalized)
                | (Finalizing, Finalized)
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "INITIAL",
            Self::Requesting => "REQUESTING",
            Self::Requested => "REQUESTED",
            Self::Offering => "OFFERING",
            Self::Offered => "OFFERED",
            Self::Accepting => "ACCEPTING",
            Self::Accepted => "ACCEPTED",
            Self::Agreeing => "AGREEING",
            Self::Agreed => "AGREED",
            Self::Verifying => "VERIFYING",
            Self::Verified => "VERIFIED",
            Self::Finalizing => "FINALIZING",
            Self::Finalized => "FINALIZED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for NegotiationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.to_string() == s)
            .ok_or_else(|| format!("Invalid negotiation state: {s}"))
    }
}

impl Default for NegotiationState {
    fn default() -> Self {
        Self::Initial
    }
}
