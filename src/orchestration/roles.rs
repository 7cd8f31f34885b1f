//! # Role Descriptors
//!
//! A role is data, not a subtype: the negotiation type it serves plus an
//! ordered list of `(state, transition function)` registrations. The
//! [`StateMachineManager`](super::manager::StateMachineManager) is the same
//! engine for both roles and simply walks the registrations in order.

use super::transitions::{process_terminating, TransitionContext};
use super::{consumer, provider};
use crate::error::NegotiationResult;
use crate::models::{Negotiation, NegotiationType};
use crate::state_machine::NegotiationState;
use futures::future::BoxFuture;
use std::fmt;

/// Handles one due entity. `Ok(false)` means deliberately skipped.
pub type TransitionFn =
    for<'a> fn(&'a TransitionContext, Negotiation) -> BoxFuture<'a, NegotiationResult<bool>>;

/// Predicate that diverts a due entity to `pending` instead of processing it
pub trait PendingGuard: Send + Sync {
    fn should_pend(&self, negotiation: &Negotiation) -> bool;
}

impl<F> PendingGuard for F
where
    F: Fn(&Negotiation) -> bool + Send + Sync,
{
    fn should_pend(&self, negotiation: &Negotiation) -> bool {
        self(negotiation)
    }
}

#[derive(Clone)]
pub struct RoleDescriptor {
    negotiation_type: NegotiationType,
    processors: Vec<(NegotiationState, TransitionFn)>,
}

impl fmt::Debug for RoleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleDescriptor")
            .field("negotiation_type", &self.negotiation_type)
            .field("states", &self.states().collect::<Vec<_>>())
            .finish()
    }
}

impl RoleDescriptor {
    pub fn new(negotiation_type: NegotiationType) -> Self {
        Self {
            negotiation_type,
            processors: Vec::new(),
        }
    }

    /// Register `process` for entities in `state`
    pub fn on(mut self, state: NegotiationState, process: TransitionFn) -> Self {
        self.processors.push((state, process));
        self
    }

    pub fn negotiation_type(&self) -> NegotiationType {
        self.negotiation_type
    }

    pub fn processors(&self) -> &[(NegotiationState, TransitionFn)] {
        &self.processors
    }

    pub fn states(&self) -> impl Iterator<Item = NegotiationState> + '_ {
        self.processors.iter().map(|(state, _)| *state)
    }

    pub fn consumer() -> Self {
        Self::new(NegotiationType::Consumer)
            .on(NegotiationState::Initial, consumer::process_initial)
            .on(NegotiationState::Requesting, consumer::process_requesting)
            .on(NegotiationState::Accepting, consumer::process_accepting)
            .on(NegotiationState::Agreed, consumer::process_agreed)
            .on(NegotiationState::Verifying, consumer::process_verifying)
            .on(NegotiationState::Terminating, process_terminating)
    }

    pub fn provider() -> Self {
        Self::new(NegotiationType::Provider)
            .on(NegotiationState::Offering, provider::process_offering)
            .on(NegotiationState::Requested, provider::process_requested)
            .on(NegotiationState::Accepted, provider::process_accepted)
            .on(NegotiationState::Agreeing, provider::process_agreeing)
            .on(NegotiationState::Verified, provider::process_verified)
            .on(NegotiationState::Finalizing, provider::process_finalizing)
            .on(NegotiationState::Terminating, process_terminating)
    }
}
