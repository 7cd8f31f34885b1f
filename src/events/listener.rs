//! Listener fan-out for negotiation transitions.
//!
//! Listeners are invoked synchronously, in registration order. For a single
//! transition the sequence is always: `pre_transition` → (persist) →
//! `post_transition` → named lifecycle hook.

use crate::models::Negotiation;
use crate::state_machine::{NegotiationEvent, NegotiationState};
use std::fmt;
use std::sync::Arc;

/// Observer of negotiation transitions; every hook defaults to a no-op
pub trait NegotiationListener: Send + Sync {
    /// Before the entity is mutated and persisted
    fn pre_transition(&self, _negotiation: &Negotiation, _to: NegotiationState) {}

    /// After the new state has been persisted
    fn post_transition(&self, _negotiation: &Negotiation, _from: NegotiationState) {}

    fn initiated(&self, _negotiation: &Negotiation) {}
    fn requested(&self, _negotiation: &Negotiation) {}
    fn offered(&self, _negotiation: &Negotiation) {}
    fn accepted(&self, _negotiation: &Negotiation) {}
    fn agreed(&self, _negotiation: &Negotiation) {}
    fn verified(&self, _negotiation: &Negotiation) {}
    fn finalized(&self, _negotiation: &Negotiation) {}
    fn terminated(&self, _negotiation: &Negotiation) {}

    /// Retry budget exhausted or dispatch rejected; fired before the terminal transition
    fn failed(&self, _negotiation: &Negotiation, _error: &str) {}
}

#[derive(Clone, Default)]
pub struct NegotiationObservable {
    listeners: Vec<Arc<dyn NegotiationListener>>,
}

impl fmt::Debug for NegotiationObservable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationObservable")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl NegotiationObservable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn NegotiationListener>) {
        self.listeners.push(listener);
    }

    pub fn with_listener(mut self, listener: Arc<dyn NegotiationListener>) -> Self {
        self.register(listener);
        self
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn invoke_for_each(&self, f: impl Fn(&dyn NegotiationListener)) {
        for listener in &self.listeners {
            f(listener.as_ref());
        }
    }

    pub fn pre_transition(&self, negotiation: &Negotiation, to: NegotiationState) {
        self.invoke_for_each(|l| l.pre_transition(negotiation, to));
    }

    /// Post hook plus the named hook for the state just entered
    pub fn post_transition(&self, negotiation: &Negotiation, from: NegotiationState) {
        self.invoke_for_each(|l| l.post_transition(negotiation, from));
        if let Some(event) = NegotiationEvent::for_state(negotiation.state()) {
            self.notify(event, negotiation);
        }
    }

    pub fn failed(&self, negotiation: &Negotiation, error: &str) {
        self.invoke_for_each(|l| l.failed(negotiation, error));
    }

    pub fn notify(&self, event: NegotiationEvent, negotiation: &Negotiation) {
        self.invoke_for_each(|l| match event {
            NegotiationEvent::Initiated => l.initiated(negotiation),
            NegotiationEvent::Requested => l.requested(negotiation),
            NegotiationEvent::Offered => l.offered(negotiation),
            NegotiationEvent::Accepted => l.accepted(negotiation),
            NegotiationEvent::Agreed => l.agreed(negotiation),
            NegotiationEvent::Verified => l.verified(negotiation),
            NegotiationEvent::Finalized => l.finalized(negotiation),
            NegotiationEvent::Terminated => l.terminated(negotiation),
        });
    }
}
