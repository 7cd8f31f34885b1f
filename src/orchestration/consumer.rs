//! Consumer (initiator) transition functions.
//!
//! One function per active consumer state. Each returns `Ok(true)` once the
//! entity has been handled and persisted, whatever the dispatch outcome.

use super::transitions::TransitionContext;
use crate::dispatch::{NegotiationEventType, ProtocolMessageBody};
use crate::error::NegotiationResult;
use crate::models::Negotiation;
use crate::state_machine::NegotiationState;
use futures::future::BoxFuture;

/// INITIAL → REQUESTING
pub fn process_initial(
    ctx: &TransitionContext,
    mut negotiation: Negotiation,
) -> BoxFuture<'_, NegotiationResult<bool>> {
    Box::pin(async move {
        ctx.transition(&mut negotiation, NegotiationState::Requesting)
            .await?;
        Ok(true)
    })
}

/// REQUESTING: send the contract request, REQUESTED once acknowledged.
/// The acknowledgement carries the provider's process id.
pub fn process_requesting(
    ctx: &TransitionContext,
    mut negotiation: Negotiation,
) -> BoxFuture<'_, NegotiationResult<bool>> {
    Box::pin(async move {
        let Some(callback_address) = ctx.resolve_callback_address(&mut negotiation).await? else {
            return Ok(true);
        };
        let Some(offer) = negotiation.last_contract_offer().cloned() else {
            ctx.fail(&mut negotiation, "No contract offer to request").await?;
            return Ok(true);
        };

        let body = ProtocolMessageBody::ContractRequest {
            offer,
            callback_address,
        };
        if let Some(ack) = ctx
            .dispatch(&mut negotiation, "Send contract request", body)
            .await?
        {
            if let Some(process_id) = ack.process_id {
                negotiation.set_correlation_id(process_id)?;
            }
            ctx.transition(&mut negotiation, NegotiationState::Requested)
                .await?;
        }
        Ok(true)
    })
}

/// ACCEPTING: tell the provider the offer is accepted
pub fn process_accepting(
    ctx: &TransitionContext,
    mut negotiation: Negotiation,
) -> BoxFuture<'_, NegotiationResult<bool>> {
    Box::pin(async move {
        let body = ProtocolMessageBody::NegotiationEvent {
            event_type: NegotiationEventType::Accepted,
        };
        if ctx
            .dispatch(&mut negotiation, "Send accepted event", body)
            .await?
            .is_some()
        {
            ctx.transition(&mut negotiation, NegotiationState::Accepted)
                .await?;
        }
        Ok(true)
    })
}

/// AGREED → VERIFYING
pub fn process_agreed(
    ctx: &TransitionContext,
    mut negotiation: Negotiation,
) -> BoxFuture<'_, NegotiationResult<bool>> {
    Box::pin(async move {
        ctx.transition(&mut negotiation, NegotiationState::Verifying)
            .await?;
        Ok(true)
    })
}

/// VERIFYING: confirm the agreement to the provider
pub fn process_verifying(
    ctx: &TransitionContext,
    mut negotiation: Negotiation,
) -> BoxFuture<'_, NegotiationResult<bool>> {
    Box::pin(async move {
        if ctx
            .dispatch(
                &mut negotiation,
                "Send agreement verification",
                ProtocolMessageBody::AgreementVerification,
            )
            .await?
            .is_some()
        {
            ctx.transition(&mut negotiation, NegotiationState::Verified)
                .await?;
        }
        Ok(true)
    })
}
