use super::listener::NegotiationListener;
use crate::clock::{SharedClock, SystemClock};
use crate::models::Negotiation;
use crate::state_machine::{NegotiationEvent, NegotiationState};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Broadcast publisher for negotiation lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
    clock: SharedClock,
}

/// Event that has been published
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: String,
    pub context: Value,
    pub published_at: DateTime<Utc>,
}

impl EventPublisher {
    /// Create a publisher with the given channel capacity, stamping events from `clock`
    pub fn new(capacity: usize, clock: SharedClock) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, clock }
    }

    /// Publish an event and return how many subscribers received it.
    /// Events are fire-and-forget, so having no subscribers is not an error.
    pub fn publish(&self, event_name: impl Into<String>, context: Value) -> usize {
        let event = PublishedEvent {
            name: event_name.into(),
            context,
            published_at: self.clock.now(),
        };
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000, Arc::new(SystemClock))
    }
}

/// Listener that forwards lifecycle milestones to an [`EventPublisher`]
#[derive(Debug, Clone)]
pub struct EventPublishingListener {
    publisher: EventPublisher,
}

impl EventPublishingListener {
    pub fn new(publisher: EventPublisher) -> Self {
        Self { publisher }
    }

    fn send(&self, name: String, negotiation: &Negotiation, context: Value) {
        let delivered = self.publisher.publish(name.as_str(), context);
        trace!(
            negotiation_id = negotiation.id(),
            event = %name,
            delivered,
            "Published negotiation event"
        );
    }

    fn publish(
        &self,
        event: NegotiationEvent,
        negotiation: &Negotiation,
        from: Option<NegotiationState>,
    ) {
        self.send(event.event_name(), negotiation, build_event_context(negotiation, from));
    }
}

impl NegotiationListener for EventPublishingListener {
    fn post_transition(&self, negotiation: &Negotiation, from: NegotiationState) {
        if let Some(event) = NegotiationEvent::for_state(negotiation.state()) {
            self.publish(event, negotiation, Some(from));
        }
    }

    fn initiated(&self, negotiation: &Negotiation) {
        self.publish(NegotiationEvent::Initiated, negotiation, None);
    }

    fn failed(&self, negotiation: &Negotiation, error: &str) {
        let mut context = build_event_context(negotiation, None);
        context["error"] = Value::String(error.to_string());
        self.send(FAILED_EVENT.to_string(), negotiation, context);
    }
}

pub const FAILED_EVENT: &str = "negotiation.failed";

fn build_event_context(negotiation: &Negotiation, from: Option<NegotiationState>) -> Value {
    json!({
        "negotiation_id": negotiation.id(),
        "correlation_id": negotiation.correlation_id(),
        "negotiation_type": negotiation.negotiation_type(),
        "counter_party_id": negotiation.counter_party_id(),
        "from_state": from.map(|s| s.to_string()),
        "to_state": negotiation.state().to_string(),
        "state_count": negotiation.state_count(),
        "error_detail": negotiation.error_detail(),
        "contract_agreement_id": negotiation.contract_agreement().map(|a| a.id.clone()),
        "trace_context": negotiation.trace_context(),
    })
}
