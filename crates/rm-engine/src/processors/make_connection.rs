//! WS-MakeConnection: serve messages parked for an unreachable peer, and
//! build the polls this endpoint sends itself.

use crate::domain::{
    EndpointReference, FaultKind, MakeConnection, MessageType, RmEnvelope, RmVersion, RmsBean,
    SenderBean, SenderQuery, SequenceEvent, SequenceFault,
};
use crate::error::RmResult;
use crate::processors::outbound::{discard, prepare_outbound, queue_outbound, sender_bean};
use crate::processors::EngineContext;
use crate::store::Transaction;
use crate::workers::retransmission::{adjust, Decision};
use tracing::{debug, error, info};

/// WS-MC action URI.
pub const MAKE_CONNECTION_ACTION: &str = "http://docs.oasis-open.org/ws-rx/wsmc/200702/MakeConnection";

fn selects(poll: &MakeConnection, bean: &SenderBean) -> bool {
    let address_ok = poll
        .address
        .as_ref()
        .map_or(true, |address| bean.to_address.as_ref() == Some(address));
    let identifier_ok = poll
        .identifier
        .as_ref()
        .map_or(true, |id| bean.sequence_id.as_ref() == Some(id));
    address_ok && identifier_ok
}

/// Answer a poll with the oldest due message waiting for it, if any.
pub fn handle_make_connection(
    ctx: &EngineContext,
    tx: &mut Transaction,
    envelope: &RmEnvelope,
    poll: &MakeConnection,
) -> RmResult<Option<RmEnvelope>> {
    if poll.address.is_none() && poll.identifier.is_none() {
        return Err(SequenceFault::new(
            FaultKind::InvalidMessage,
            None,
            format!("MakeConnection {} has no selector", envelope.message_id),
        )
        .into());
    }

    let now = ctx.now();
    let mut waiting: Vec<SenderBean> = ctx.store.snapshot(&SenderQuery {
        send: Some(true),
        transport_available: Some(false),
        ..Default::default()
    });
    waiting.retain(|bean| selects(poll, bean) && bean.time_to_send <= now as i64);
    waiting.sort_by_key(|bean| (bean.time_to_send, bean.message_number));

    for candidate in waiting {
        let mut rms: Option<RmsBean> = match &candidate.internal_sequence_id {
            Some(internal) => tx.retrieve(internal)?,
            None => None,
        };
        if rms.as_ref().is_some_and(|rms| rms.state.is_terminal()) {
            continue;
        }
        let Some(mut bean) = tx.retrieve::<SenderBean>(&candidate.message_id)? else {
            continue;
        };
        if bean.transport_available || !bean.send || !selects(poll, &bean) {
            continue;
        }

        let next_time_to_send = match adjust(&ctx.config, &mut bean, rms.as_ref(), now) {
            Decision::Send { next_time_to_send } => next_time_to_send,
            Decision::GiveUp { reason } => {
                bean.send = false;
                tx.update(bean.clone())?;
                if let Some(rms) = rms.as_mut() {
                    if !rms.state.is_terminal() {
                        rms.apply(SequenceEvent::TimeOut)?;
                    }
                    rms.record_send_error(reason.clone(), now);
                    tx.update(rms.clone())?;
                }
                error!(
                    "[rm-engine] MakeConnection {}: giving up on {}: {}",
                    envelope.message_id, bean.message_id, reason
                );
                continue;
            }
        };

        let response = prepare_outbound(ctx, tx, &bean, rms.as_ref())?;
        if bean.resend {
            bean.time_to_send = next_time_to_send;
            tx.update(bean.clone())?;
        } else {
            discard(tx, &bean.message_id)?;
        }
        info!(
            "[rm-engine] MakeConnection {} served {:?} {}",
            envelope.message_id, bean.message_type, bean.message_id
        );
        return Ok(Some(response));
    }

    debug!(
        "[rm-engine] MakeConnection {}: nothing pending",
        envelope.message_id
    );
    Ok(None)
}

/// Queue a poll to `to` with the given selector.
pub fn queue_poll(
    ctx: &EngineContext,
    tx: &mut Transaction,
    to: &EndpointReference,
    selector: MakeConnection,
    version: RmVersion,
) -> RmResult<String> {
    let mut envelope = RmEnvelope::new();
    envelope.to = Some(to.clone());
    envelope.action = Some(MAKE_CONNECTION_ACTION.to_string());
    envelope.headers.rm_version = version;
    envelope.headers.make_connection = Some(selector);

    let bean = sender_bean(&envelope, MessageType::MakeConnection, None, ctx.now());
    let message_id = bean.message_id.clone();
    queue_outbound(tx, envelope, bean)?;
    Ok(message_id)
}
