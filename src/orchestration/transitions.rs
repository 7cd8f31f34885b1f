//! # Transition Primitives
//!
//! Everything the per-role transition functions share. A persisted state
//! change always runs the same cycle:
//!
//! ```text
//! pre_transition hooks → entity mutation → store.save (releases lease)
//!                      → post_transition hooks → named lifecycle hook
//! ```
//!
//! Outbound steps go through [`TransitionContext::dispatch`], which matches
//! the retry [`Outcome`] and handles both failure arms itself. Callers only
//! see `Some(ack)` when they should advance.

use crate::clock::SharedClock;
use crate::dispatch::{
    CallbackAddressResolver, NegotiationAck, ProtocolMessageBody, RemoteMessage,
    RemoteMessageDispatcher,
};
use crate::error::{NegotiationError, NegotiationResult};
use crate::events::NegotiationObservable;
use crate::logging::log_negotiation_operation;
use crate::models::Negotiation;
use crate::retry::{Outcome, RetryProcessor};
use crate::state_machine::NegotiationState;
use crate::store::NegotiationStore;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Collaborators a transition function may touch
pub struct TransitionContext {
    store: Arc<dyn NegotiationStore>,
    dispatcher: Arc<dyn RemoteMessageDispatcher>,
    callback_resolver: Arc<dyn CallbackAddressResolver>,
    observable: NegotiationObservable,
    retry: RetryProcessor,
    clock: SharedClock,
}

impl fmt::Debug for TransitionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionContext")
            .field("lease_holder", &self.store.lease_holder())
            .field("observable", &self.observable)
            .field("retry", &self.retry)
            .field("clock", &self.clock)
            .finish()
    }
}

impl TransitionContext {
    pub fn new(
        store: Arc<dyn NegotiationStore>,
        dispatcher: Arc<dyn RemoteMessageDispatcher>,
        callback_resolver: Arc<dyn CallbackAddressResolver>,
        retry: RetryProcessor,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            dispatcher,
            callback_resolver,
            observable: NegotiationObservable::new(),
            retry,
            clock,
        }
    }

    pub fn with_observable(mut self, observable: NegotiationObservable) -> Self {
        self.observable = observable;
        self
    }

    pub fn store(&self) -> &Arc<dyn NegotiationStore> {
        &self.store
    }

    pub fn observable(&self) -> &NegotiationObservable {
        &self.observable
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Move `negotiation` to `to` and persist, with the full listener cycle
    pub async fn transition(
        &self,
        negotiation: &mut Negotiation,
        to: NegotiationState,
    ) -> NegotiationResult<()> {
        self.apply(negotiation, to, None).await
    }

    /// Same as [`Self::transition`], recording `detail` as the error detail
    pub async fn transition_with_detail(
        &self,
        negotiation: &mut Negotiation,
        to: NegotiationState,
        detail: impl Into<String>,
    ) -> NegotiationResult<()> {
        self.apply(negotiation, to, Some(detail.into())).await
    }

    async fn apply(
        &self,
        negotiation: &mut Negotiation,
        to: NegotiationState,
        detail: Option<String>,
    ) -> NegotiationResult<()> {
        let from = negotiation.state();
        if !from.can_transition_to(to) {
            return Err(NegotiationError::invalid_transition(from, to));
        }

        self.observable.pre_transition(negotiation, to);

        let now = self.now();
        match to {
            NegotiationState::Terminated => negotiation.transition_to_terminated(detail, now)?,
            NegotiationState::Terminating => negotiation.transition_to_terminating(detail, now)?,
            _ => {
                negotiation.transition_to(to, now)?;
                if let Some(detail) = detail {
                    negotiation.set_error_detail(detail);
                }
            }
        }

        self.store.save(negotiation).await?;

        debug!(
            negotiation_id = negotiation.id(),
            negotiation_type = %negotiation.negotiation_type(),
            from = %from,
            to = %to,
            state_count = negotiation.state_count(),
            "Negotiation transitioned"
        );

        self.observable.post_transition(negotiation, from);
        Ok(())
    }

    /// Terminal failure: `failed` hook, then TERMINATED with `detail`.
    /// An error detail already on the entity (a termination reason) is kept
    /// in front of the new one.
    pub async fn fail(
        &self,
        negotiation: &mut Negotiation,
        detail: impl Into<String>,
    ) -> NegotiationResult<()> {
        let detail = detail.into();
        warn!(
            negotiation_id = negotiation.id(),
            state = %negotiation.state(),
            error = %detail,
            "Negotiation failed, terminating"
        );
        log_negotiation_operation(
            "fail",
            Some(negotiation.id()),
            Some(&negotiation.negotiation_type().to_string()),
            Some(&negotiation.state().to_string()),
            "terminated",
            Some(&detail),
        );
        self.observable.failed(negotiation, &detail);
        let recorded = match negotiation.error_detail() {
            Some(existing) => format!("{existing}; {detail}"),
            None => detail,
        };
        self.transition_with_detail(negotiation, NegotiationState::Terminated, recorded)
            .await
    }

    /// Keep the current state, schedule another attempt and release the lease
    async fn retry_later(&self, negotiation: &mut Negotiation) -> NegotiationResult<()> {
        let now = self.now();
        let retry_at = self.retry.retry_at(negotiation, now);
        negotiation.mark_retry(retry_at, now);
        self.store.save(negotiation).await?;
        debug!(
            negotiation_id = negotiation.id(),
            state = %negotiation.state(),
            retry_count = negotiation.retry_count(),
            retry_at = %retry_at,
            "Negotiation scheduled for retry"
        );
        Ok(())
    }

    /// Callback address for the negotiation's protocol.
    ///
    /// `None` means the negotiation was already failed and persisted.
    pub async fn resolve_callback_address(
        &self,
        negotiation: &mut Negotiation,
    ) -> NegotiationResult<Option<String>> {
        match self.callback_resolver.resolve(negotiation.protocol()) {
            Some(address) => {
                negotiation.set_callback_address(address.clone());
                Ok(Some(address))
            }
            None => {
                let detail = format!(
                    "No callback address found for protocol: {}",
                    negotiation.protocol()
                );
                self.fail(negotiation, detail).await?;
                Ok(None)
            }
        }
    }

    /// Send `body` to the counter-party under the step's stable message id.
    ///
    /// Returns the acknowledgement on success. Retryable and final failures
    /// are persisted here and yield `None`.
    pub async fn dispatch(
        &self,
        negotiation: &mut Negotiation,
        description: &str,
        body: ProtocolMessageBody,
    ) -> NegotiationResult<Option<NegotiationAck>> {
        let message_id = negotiation.outbound_message_id();
        let message = RemoteMessage::for_negotiation(negotiation, message_id, body);

        let outcome = self
            .retry
            .execute(negotiation, description, self.dispatcher.dispatch(message))
            .await;

        match outcome {
            Outcome::Success(ack) => Ok(Some(ack)),
            Outcome::RetryableFailure(_) => {
                self.retry_later(negotiation).await?;
                Ok(None)
            }
            Outcome::FinalFailure(error) => {
                self.fail(negotiation, format!("{description} failed: {error}"))
                    .await?;
                Ok(None)
            }
        }
    }
}

/// TERMINATING, shared by both roles: notify the counter-party, then stop.
/// A notice that fails permanently still ends in TERMINATED.
pub fn process_terminating(
    ctx: &TransitionContext,
    mut negotiation: Negotiation,
) -> BoxFuture<'_, NegotiationResult<bool>> {
    Box::pin(async move {
        let body = ProtocolMessageBody::Termination {
            reason: negotiation.error_detail().map(str::to_string),
        };
        if ctx
            .dispatch(&mut negotiation, "Send termination", body)
            .await?
            .is_some()
        {
            ctx.transition(&mut negotiation, NegotiationState::Terminated)
                .await?;
        }
        Ok(true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::RetryConfig;
    use crate::dispatch::StaticCallbackResolver;
    use crate::error::DispatchError;
    use crate::events::NegotiationListener;
    use crate::models::{NegotiationType, NewNegotiation};
    use crate::store::InMemoryNegotiationStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Unreachable;

    #[async_trait]
    impl RemoteMessageDispatcher for Unreachable {
        async fn dispatch(&self, message: RemoteMessage) -> Result<NegotiationAck, DispatchError> {
            Err(DispatchError::Unreachable {
                address: message.counter_party_address,
                reason: "connection refused".into(),
            })
        }
    }

    #[derive(Default)]
    struct FailureRecorder(Mutex<Vec<String>>);

    impl NegotiationListener for FailureRecorder {
        fn failed(&self, _negotiation: &Negotiation, error: &str) {
            self.0.lock().push(error.to_string());
        }
    }

    fn context(
        store: &InMemoryNegotiationStore,
        clock: Arc<ManualClock>,
        recorder: Arc<FailureRecorder>,
    ) -> TransitionContext {
        TransitionContext::new(
            Arc::new(store.clone()),
            Arc::new(Unreachable),
            Arc::new(StaticCallbackResolver::new()),
            RetryProcessor::new(
                RetryConfig::fixed(1, Duration::from_secs(1)),
                Duration::from_secs(1),
            ),
            clock,
        )
        .with_observable(NegotiationObservable::new().with_listener(recorder))
    }

    fn negotiation(now: DateTime<Utc>) -> Negotiation {
        Negotiation::new(
            NewNegotiation {
                negotiation_type: Some(NegotiationType::Consumer),
                counter_party_id: "provider".into(),
                counter_party_address: "http://provider".into(),
                protocol: "dsp".into(),
                ..Default::default()
            },
            now,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_entity_untouched() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryNegotiationStore::new("w", Duration::from_secs(60), clock.clone());
        let ctx = context(&store, clock.clone(), Arc::default());
        let mut n = negotiation(clock.now());

        let err = ctx.transition(&mut n, NegotiationState::Agreed).await.unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidTransition { .. }));
        assert_eq!(n.state(), NegotiationState::Initial);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_callback_address_terminates() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryNegotiationStore::new("w", Duration::from_secs(60), clock.clone());
        let recorder = Arc::new(FailureRecorder::default());
        let ctx = context(&store, clock.clone(), recorder.clone());
        let mut n = negotiation(clock.now());

        assert_eq!(ctx.resolve_callback_address(&mut n).await.unwrap(), None);
        assert_eq!(n.state(), NegotiationState::Terminated);
        assert_eq!(
            n.error_detail(),
            Some("No callback address found for protocol: dsp")
        );
        assert_eq!(recorder.0.lock().len(), 1);

        let stored = store.find_by_id(n.id()).await.unwrap().unwrap();
        assert_eq!(stored.state(), NegotiationState::Terminated);
    }

    #[tokio::test]
    async fn test_failed_termination_notice_still_terminates() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryNegotiationStore::new("w", Duration::from_secs(60), clock.clone());
        let ctx = context(&store, clock.clone(), Arc::default());
        let mut n = negotiation(clock.now());
        n.transition_to_terminating(Some("policy violation".into()), clock.now())
            .unwrap();

        assert!(process_terminating(&ctx, n.clone()).await.unwrap());

        let stored = store.find_by_id(n.id()).await.unwrap().unwrap();
        assert_eq!(stored.state(), NegotiationState::Terminated);
        let detail = stored.error_detail().unwrap();
        assert!(detail.starts_with("policy violation; "), "unexpected detail: {detail}");
        assert!(detail.contains("Send termination failed"));
        assert!(detail.contains("connection refused"));
    }
}
