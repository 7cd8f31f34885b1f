// Negotiation state model
//
// Protocol states, their directed transition graph, and the named lifecycle
// events listeners subscribe to.

pub mod events;
pub mod states;

pub use events::NegotiationEvent;
pub use states::NegotiationState;
