//! Shared helpers for queued outbound messages.

use crate::domain::{
    MessageType, RmEnvelope, RmdBean, RmdQuery, RmsBean, SenderBean, SenderQuery, Timestamp,
};
use crate::error::{RmError, RmResult};
use crate::processors::{acknowledgement, EngineContext};
use crate::store::Transaction;
use uuid::Uuid;

/// Fresh key for the message store.
pub fn new_store_key() -> String {
    Uuid::new_v4().to_string()
}

/// Pending-send record for `envelope`, due at `now`.
pub fn sender_bean(
    envelope: &RmEnvelope,
    message_type: MessageType,
    rms: Option<&RmsBean>,
    now: Timestamp,
) -> SenderBean {
    let mut bean = SenderBean::new(envelope.message_id.clone(), new_store_key(), message_type);
    bean.to_address = envelope.to.as_ref().map(|epr| epr.address.clone());
    bean.time_to_send = now as i64;
    if let Some(rms) = rms {
        bean.internal_sequence_id = Some(rms.internal_sequence_id.clone());
        bean.sequence_id = rms.sequence_id.clone();
    }
    bean
}

/// Store `envelope` and queue `bean` to transmit it.
pub fn queue_outbound(tx: &mut Transaction, envelope: RmEnvelope, bean: SenderBean) -> RmResult<()> {
    tx.store_message(&bean.message_store_key, envelope)?;
    tx.insert(bean)
}

/// Remove a pending-send record and its stored message.
pub fn discard(tx: &mut Transaction, message_id: &str) -> RmResult<Option<SenderBean>> {
    let removed = tx.delete::<SenderBean>(message_id)?;
    if let Some(bean) = &removed {
        tx.remove_message(&bean.message_store_key)?;
    }
    Ok(removed)
}

/// Remove every pending-send record matching `query`.
pub fn discard_matching(tx: &mut Transaction, query: &SenderQuery) -> RmResult<usize> {
    let beans = tx.find::<SenderBean, _>(query)?;
    for bean in &beans {
        discard(tx, &bean.message_id)?;
    }
    Ok(beans.len())
}

/// Build the wire form of a pending-send record as of now.
///
/// Stamps the negotiated sequence id, refreshes standalone acknowledgements
/// and piggybacks acknowledgements for the reverse sequence.
pub fn prepare_outbound(
    ctx: &EngineContext,
    tx: &mut Transaction,
    bean: &SenderBean,
    rms: Option<&RmsBean>,
) -> RmResult<RmEnvelope> {
    let mut envelope =
        tx.retrieve_message(&bean.message_store_key)?
            .ok_or_else(|| RmError::MessageNotFound {
                key: bean.message_store_key.clone(),
            })?;

    if let Some(sequence_id) = &bean.sequence_id {
        let headers = &mut envelope.headers;
        if let Some(sequence) = headers.sequence.as_mut() {
            sequence.identifier.clone_from(sequence_id);
        }
        if let Some(terminate) = headers.terminate_sequence.as_mut() {
            terminate.identifier.clone_from(sequence_id);
        }
        if let Some(close) = headers.close_sequence.as_mut() {
            close.identifier.clone_from(sequence_id);
        }
        for request in headers.ack_requested.iter_mut() {
            request.identifier.clone_from(sequence_id);
        }
    }

    match bean.message_type {
        MessageType::Acknowledgement => {
            if let Some(rmd) = bean
                .sequence_id
                .as_deref()
                .and_then(|id| ctx.store.peek::<RmdBean>(id))
            {
                envelope.headers.acknowledgements = vec![acknowledgement::build_ack(&rmd)];
            }
        }
        MessageType::Application => {
            if let Some(rms) = rms {
                piggyback_acks(ctx, tx, &mut envelope, rms, bean.to_address.as_deref())?;
            }
        }
        _ => {}
    }
    Ok(envelope)
}

fn piggyback_acks(
    ctx: &EngineContext,
    tx: &mut Transaction,
    envelope: &mut RmEnvelope,
    rms: &RmsBean,
    destination: Option<&str>,
) -> RmResult<()> {
    let linked: Vec<RmdBean> = ctx.store.snapshot(&RmdQuery {
        outbound_internal_sequence: Some(rms.internal_sequence_id.clone()),
        ..Default::default()
    });
    for rmd in linked {
        let acks_to = rmd.acks_to_epr.as_ref().map(|epr| epr.address.as_str());
        if rmd.server_completed_messages.is_empty() || acks_to != destination {
            continue;
        }
        if envelope
            .headers
            .acknowledgements
            .iter()
            .any(|ack| ack.identifier == rmd.sequence_id)
        {
            continue;
        }
        envelope
            .headers
            .acknowledgements
            .push(acknowledgement::build_ack(&rmd));
        discard_matching(
            tx,
            &SenderQuery {
                sequence_id: Some(rmd.sequence_id.clone()),
                message_type: Some(MessageType::Acknowledgement),
                ..Default::default()
            },
        )?;
    }
    Ok(())
}
