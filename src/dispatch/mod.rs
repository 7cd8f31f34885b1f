//! # Remote Message Dispatch
//!
//! Interfaces for talking to the counter-party. The wire format and the HTTP
//! transport live behind [`RemoteMessageDispatcher`]; this crate only builds
//! [`RemoteMessage`] values and interprets the acknowledgement.

pub mod messages;

use crate::error::DispatchError;
use async_trait::async_trait;
use std::collections::HashMap;

pub use messages::{NegotiationAck, NegotiationEventType, ProtocolMessageBody, RemoteMessage};

/// Sends protocol messages to counter-party addresses
#[async_trait]
pub trait RemoteMessageDispatcher: Send + Sync {
    async fn dispatch(&self, message: RemoteMessage) -> Result<NegotiationAck, DispatchError>;
}

/// Resolves the address counter-parties should call back on for a protocol
pub trait CallbackAddressResolver: Send + Sync {
    fn resolve(&self, protocol: &str) -> Option<String>;
}

/// Resolver backed by a fixed protocol → address table
#[derive(Debug, Clone, Default)]
pub struct StaticCallbackResolver {
    addresses: HashMap<String, String>,
}

impl StaticCallbackResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, protocol: impl Into<String>, address: impl Into<String>) -> Self {
        self.addresses.insert(protocol.into(), address.into());
        self
    }
}

impl CallbackAddressResolver for StaticCallbackResolver {
    fn resolve(&self, protocol: &str) -> Option<String> {
        self.addresses.get(protocol).cloned()
    }
}
