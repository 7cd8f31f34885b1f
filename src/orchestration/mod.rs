//! # Orchestration
//!
//! The scheduling engine and the per-role transition functions it drives.
//!
//! - [`transitions`]: shared primitives (persisted transition with listener
//!   cycle, dispatch with retry outcome handling, terminal failure)
//! - [`consumer`] / [`provider`]: one function per active state of each role
//! - [`roles`]: role descriptors mapping states to transition functions
//! - [`manager`]: the polling scheduler

pub mod consumer;
pub mod manager;
pub mod provider;
pub mod roles;
pub mod transitions;

pub use manager::{ManagerState, StateMachineManager};
pub use roles::{PendingGuard, RoleDescriptor, TransitionFn};
pub use transitions::TransitionContext;
