#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Negotiation Core
//!
//! State-machine core for contract negotiations between a consumer and a
//! provider in a dataspace connector.
//!
//! ## Architecture
//!
//! A polling [`StateMachineManager`] per role leases due negotiations from a
//! [`NegotiationStore`], runs the transition function registered for their
//! state, and releases the lease when the result is saved. Outbound protocol
//! messages go through a [`RetryProcessor`] which classifies each attempt as
//! success, retryable failure (backoff, same state, same message id) or final
//! failure (TERMINATED with an error detail). Listeners see every transition
//! before and after it is persisted.
//!
//! ## Module Organization
//!
//! - [`models`] - Negotiation aggregate and contract value objects
//! - [`state_machine`] - Protocol states, transition graph, lifecycle events
//! - [`store`] - Leased persistence (in-memory and PostgreSQL)
//! - [`retry`] - Retry processor and backoff
//! - [`orchestration`] - Scheduler, role descriptors, transition functions
//! - [`services`] - Inbound protocol message handling
//! - [`events`] - Listener fan-out and event publishing
//! - [`dispatch`] - Counter-party messaging interfaces
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use negotiation_core::clock::SystemClock;
//! use negotiation_core::config::NegotiationConfig;
//! use negotiation_core::dispatch::{RemoteMessageDispatcher, StaticCallbackResolver};
//! use negotiation_core::orchestration::{RoleDescriptor, StateMachineManager, TransitionContext};
//! use negotiation_core::retry::RetryProcessor;
//! use negotiation_core::store::InMemoryNegotiationStore;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     dispatcher: Arc<dyn RemoteMessageDispatcher>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = NegotiationConfig::load(None)?;
//! let clock = Arc::new(SystemClock);
//! let lease_duration = config.state_machine.lease_duration();
//! let store = InMemoryNegotiationStore::new("worker-1", lease_duration, clock.clone());
//!
//! let context = TransitionContext::new(
//!     Arc::new(store),
//!     dispatcher,
//!     Arc::new(
//!         StaticCallbackResolver::new().with_address("dsp", "https://connector.example/dsp"),
//!     ),
//!     RetryProcessor::new(config.retry.clone(), config.dispatch.timeout()),
//!     clock,
//! );
//!
//! let mut manager = StateMachineManager::new(
//!     RoleDescriptor::consumer(),
//!     Arc::new(context),
//!     &config.state_machine,
//! );
//! manager.start();
//! // ...
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! PostgreSQL store tests are ignored by default and need `DATABASE_URL`:
//!
//! ```bash
//! DATABASE_URL=postgresql://localhost/negotiation_test cargo test -- --ignored
//! ```

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod retry;
pub mod services;
pub mod state_machine;
pub mod store;

pub use config::NegotiationConfig;
pub use error::{DispatchError, NegotiationError, NegotiationResult, StoreError, StoreResult};
pub use models::{ContractAgreement, ContractOffer, Negotiation, NegotiationType, NewNegotiation};
pub use orchestration::{RoleDescriptor, StateMachineManager, TransitionContext};
pub use retry::RetryProcessor;
pub use state_machine::NegotiationState;
pub use store::NegotiationStore;
