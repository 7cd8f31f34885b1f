//! # State Machine Manager
//!
//! Polling scheduler, one instance per role. Each tick walks the role's
//! registrations in order and, per state, leases a batch of due entities and
//! hands each one to its transition function.
//!
//! ## Lease release
//!
//! Every leased entity leaves the tick with its lease released:
//! - handled (`Ok(true)`): the transition function saved it
//! - pended by the guard: saved with `pending = true`
//! - skipped (`Ok(false)`) or failed (`Err`): `break_lease`
//!
//! Infrastructure errors from one entity are logged and never abort the
//! rest of the batch. A store failure while *fetching* a batch ends the tick.
//!
//! An entity advances at most one step per tick: one handled by an earlier
//! registration is handed back untouched if a later one leases it again.

use super::roles::{PendingGuard, RoleDescriptor, TransitionFn};
use super::transitions::TransitionContext;
use crate::config::StateMachineConfig;
use crate::error::NegotiationResult;
use crate::models::Negotiation;
use crate::store::Criteria;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// `tokio::time::interval` panics on a zero period
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Running,
    Stopped,
}

/// Tick logic, shared with the background loop
struct Scheduler {
    name: String,
    role: RoleDescriptor,
    context: Arc<TransitionContext>,
    pending_guard: Option<Arc<dyn PendingGuard>>,
    batch_size: usize,
}

impl Scheduler {
    async fn tick(&self) -> NegotiationResult<usize> {
        let mut processed = 0;
        let mut seen = HashSet::new();
        for (state, process) in self.role.processors() {
            let criteria = Criteria::new(*state).with_type(self.role.negotiation_type());
            let batch = self
                .context
                .store()
                .next_not_leased(self.batch_size, &criteria)
                .await?;

            for negotiation in batch {
                if !seen.insert(negotiation.id().to_string()) {
                    self.break_lease(negotiation.id()).await;
                    continue;
                }
                if self.process_one(negotiation, *process).await {
                    processed += 1;
                }
            }
        }
        Ok(processed)
    }

    async fn process_one(&self, mut negotiation: Negotiation, process: TransitionFn) -> bool {
        let id = negotiation.id().to_string();
        let store = self.context.store();

        if self
            .pending_guard
            .as_ref()
            .is_some_and(|guard| guard.should_pend(&negotiation))
        {
            negotiation.set_pending(true, self.context.now());
            match store.save(&negotiation).await {
                Ok(()) => {
                    debug!(
                        manager = %self.name,
                        negotiation_id = %id,
                        "Negotiation set to pending"
                    );
                    return true;
                }
                Err(e) => {
                    error!(
                        manager = %self.name,
                        negotiation_id = %id,
                        error = %e,
                        "Failed to persist pending flag"
                    );
                    self.break_lease(&id).await;
                    return false;
                }
            }
        }

        let state = negotiation.state();
        match process(&self.context, negotiation).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(
                    manager = %self.name,
                    negotiation_id = %id,
                    state = %state,
                    "Negotiation not processed"
                );
                self.break_lease(&id).await;
                false
            }
            Err(e) => {
                error!(
                    manager = %self.name,
                    negotiation_id = %id,
                    state = %state,
                    error = %e,
                    "Transition failed"
                );
                self.break_lease(&id).await;
                false
            }
        }
    }

    async fn break_lease(&self, id: &str) {
        if let Err(e) = self.context.store().break_lease(id).await {
            warn!(manager = %self.name, negotiation_id = id, error = %e, "Failed to break lease");
        }
    }
}

pub struct StateMachineManager {
    scheduler: Arc<Scheduler>,
    poll_interval: Duration,
    shutdown_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for StateMachineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachineManager")
            .field("name", &self.scheduler.name)
            .field("role", &self.scheduler.role)
            .field("batch_size", &self.scheduler.batch_size)
            .field("poll_interval", &self.poll_interval)
            .field("state", &self.state())
            .finish()
    }
}

impl StateMachineManager {
    pub fn new(
        role: RoleDescriptor,
        context: Arc<TransitionContext>,
        config: &StateMachineConfig,
    ) -> Self {
        let name = format!(
            "{}-{}",
            role.negotiation_type().to_string().to_lowercase(),
            context.store().lease_holder()
        );
        Self {
            scheduler: Arc::new(Scheduler {
                name,
                role,
                context,
                pending_guard: None,
                batch_size: config.batch_size,
            }),
            poll_interval: config.poll_interval().max(MIN_POLL_INTERVAL),
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Install a pending guard. Only valid before [`Self::start`].
    pub fn with_pending_guard(mut self, guard: Arc<dyn PendingGuard>) -> Self {
        if let Some(scheduler) = Arc::get_mut(&mut self.scheduler) {
            scheduler.pending_guard = Some(guard);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.scheduler.name
    }

    pub fn state(&self) -> ManagerState {
        if self.handle.is_some() {
            ManagerState::Running
        } else {
            ManagerState::Stopped
        }
    }

    /// Run a single scheduling pass; returns how many entities were processed
    #[instrument(skip(self), fields(manager = %self.scheduler.name))]
    pub async fn tick(&self) -> NegotiationResult<usize> {
        self.scheduler.tick().await
    }

    /// Spawn the polling loop
    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!(manager = %self.scheduler.name, "State machine manager already running");
            return;
        }

        info!(
            manager = %self.scheduler.name,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.scheduler.batch_size,
            "Starting state machine manager"
        );

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(&self.scheduler);
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        match scheduler.tick().await {
                            Ok(0) => {}
                            Ok(processed) => {
                                debug!(
                                    manager = %scheduler.name,
                                    processed,
                                    "Scheduling pass complete"
                                );
                            }
                            Err(e) => {
                                error!(
                                    manager = %scheduler.name,
                                    error = %e,
                                    "Scheduling pass failed"
                                );
                            }
                        }
                    }
                }
            }

            debug!(manager = %scheduler.name, "State machine loop exited");
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(handle);
    }

    /// Signal the loop and wait for the in-flight pass to finish
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        info!(manager = %self.scheduler.name, "Stopping state machine manager");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Err(e) = handle.await {
            error!(manager = %self.scheduler.name, error = %e, "State machine loop panicked");
        }
    }
}
