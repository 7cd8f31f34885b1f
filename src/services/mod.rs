//! # Services
//!
//! Inbound side of the protocol: validated reactions to counter-party
//! messages and local commands.

pub mod protocol_service;
pub mod validation;

pub use protocol_service::{InitialMessage, NegotiationProtocolService, ProcessIds, ServiceResult};
pub use validation::{ClaimToken, ContractValidationService, ValidationResult};
