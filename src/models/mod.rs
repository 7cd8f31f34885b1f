//! # Models
//!
//! The negotiation aggregate and the contract value objects it carries.

pub mod contract;
pub mod negotiation;

pub use contract::{ContractAgreement, ContractOffer, TerminationReason};
pub use negotiation::{Negotiation, NegotiationType, NewNegotiation};
