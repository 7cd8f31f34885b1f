//! Provider (responder) transition functions.

use super::transitions::TransitionContext;
use crate::dispatch::{NegotiationEventType, ProtocolMessageBody};
use crate::error::NegotiationResult;
use crate::models::{ContractAgreement, Negotiation};
use crate::state_machine::NegotiationState;
use futures::future::BoxFuture;
use tracing::debug;

/// OFFERING: send the (counter-)offer, OFFERED once acknowledged
pub fn process_offering(
    ctx: &TransitionContext,
    mut negotiation: Negotiation,
) -> BoxFuture<'_, NegotiationResult<bool>> {
    Box::pin(async move {
        let Some(callback_address) = ctx.resolve_callback_address(&mut negotiation).await? else {
            return Ok(true);
        };
        let Some(offer) = negotiation.last_contract_offer().cloned() else {
            ctx.fail(&mut negotiation, "No contract offer to send").await?;
            return Ok(true);
        };

        let body = ProtocolMessageBody::ContractOffer {
            offer,
            callback_address,
        };
        if let Some(ack) = ctx
            .dispatch(&mut negotiation, "Send contract offer", body)
            .await?
        {
            if let Some(process_id) = ack.process_id {
                negotiation.set_correlation_id(process_id)?;
            }
            ctx.transition(&mut negotiation, NegotiationState::Offered)
                .await?;
        }
        Ok(true)
    })
}

/// REQUESTED → AGREEING; requests that passed validation are accepted as-is
pub fn process_requested(
    ctx: &TransitionContext,
    mut negotiation: Negotiation,
) -> BoxFuture<'_, NegotiationResult<bool>> {
    Box::pin(async move {
        ctx.transition(&mut negotiation, NegotiationState::Agreeing)
            .await?;
        Ok(true)
    })
}

/// ACCEPTED → AGREEING
pub fn process_accepted(
    ctx: &TransitionContext,
    mut negotiation: Negotiation,
) -> BoxFuture<'_, NegotiationResult<bool>> {
    Box::pin(async move {
        ctx.transition(&mut negotiation, NegotiationState::Agreeing)
            .await?;
        Ok(true)
    })
}

/// AGREEING: send the agreement, AGREED once acknowledged.
///
/// An agreement already on the entity (from an earlier attempt) is sent again
/// unchanged, signing date included.
pub fn process_agreeing(
    ctx: &TransitionContext,
    mut negotiation: Negotiation,
) -> BoxFuture<'_, NegotiationResult<bool>> {
    Box::pin(async move {
        let agreement = match negotiation.contract_agreement() {
            Some(existing) => {
                debug!(
                    negotiation_id = negotiation.id(),
                    agreement_id = %existing.id,
                    "Reusing existing contract agreement"
                );
                existing.clone()
            }
            None => {
                let Some(offer) = negotiation.last_contract_offer() else {
                    ctx.fail(&mut negotiation, "No contract offer to agree on")
                        .await?;
                    return Ok(true);
                };
                let agreement =
                    ContractAgreement::from_offer(offer, negotiation.counter_party_id(), ctx.now());
                negotiation.set_contract_agreement(agreement.clone());
                agreement
            }
        };

        let body = ProtocolMessageBody::ContractAgreement { agreement };
        if ctx
            .dispatch(&mut negotiation, "Send contract agreement", body)
            .await?
            .is_some()
        {
            ctx.transition(&mut negotiation, NegotiationState::Agreed)
                .await?;
        }
        Ok(true)
    })
}

/// VERIFIED → FINALIZING
pub fn process_verified(
    ctx: &TransitionContext,
    mut negotiation: Negotiation,
) -> BoxFuture<'_, NegotiationResult<bool>> {
    Box::pin(async move {
        ctx.transition(&mut negotiation, NegotiationState::Finalizing)
            .await?;
        Ok(true)
    })
}

/// FINALIZING: tell the consumer the negotiation is finalized
pub fn process_finalizing(
    ctx: &TransitionContext,
    mut negotiation: Negotiation,
) -> BoxFuture<'_, NegotiationResult<bool>> {
    Box::pin(async move {
        let body = ProtocolMessageBody::NegotiationEvent {
            event_type: NegotiationEventType::Finalized,
        };
        if ctx
            .dispatch(&mut negotiation, "Send finalized event", body)
            .await?
            .is_some()
        {
            ctx.transition(&mut negotiation, NegotiationState::Finalized)
                .await?;
        }
        Ok(true)
    })
}
