//! # Events
//!
//! Listener fan-out at every transition, plus a broadcast publisher that
//! turns milestones into named events for telemetry and webhooks.

pub mod listener;
pub mod publisher;

pub use listener::{NegotiationListener, NegotiationObservable};
pub use publisher::{EventPublisher, EventPublishingListener, PublishedEvent};
