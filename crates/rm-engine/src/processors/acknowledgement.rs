//! SequenceAcknowledgement and AckRequested processing.
//!
//! Inbound acknowledgements release pending-send records on the sending
//! side. On the receiving side acknowledgements are either returned on the
//! back-channel (anonymous acks-to) or queued, one pending record per
//! sequence, until the acknowledgement interval expires.

use crate::domain::envelope::is_back_channel;
use crate::domain::{
    AckRequested, FaultKind, MessageType, RangeString, RmEnvelope, RmVersion, RmdBean, RmsBean,
    RmsQuery, SenderBean, SenderQuery, SequenceAcknowledgement, SequenceFault,
};
use crate::error::{RmError, RmResult};
use crate::processors::outbound::{discard, queue_outbound, sender_bean};
use crate::processors::{action, termination, EngineContext};
use crate::store::Transaction;
use tracing::{debug, info};

/// Current acknowledgement for an inbound sequence.
pub fn build_ack(rmd: &RmdBean) -> SequenceAcknowledgement {
    SequenceAcknowledgement {
        identifier: rmd.sequence_id.clone(),
        ranges: rmd.server_completed_messages.ranges().to_vec(),
        nacks: Vec::new(),
        is_final: rmd.rm_version == RmVersion::V1_1 && (rmd.closed || rmd.terminated),
    }
}

/// Acknowledge `rmd` in response to `request`.
///
/// Returns the acknowledgement when it travels on the back-channel; queues
/// it otherwise. `immediate` skips the acknowledgement interval.
pub fn acknowledge(
    ctx: &EngineContext,
    tx: &mut Transaction,
    rmd: &RmdBean,
    request: &RmEnvelope,
    immediate: bool,
) -> RmResult<Option<RmEnvelope>> {
    if is_back_channel(rmd.acks_to_epr.as_ref()) {
        let mut reply = request.reply();
        reply.action = Some(action(rmd.rm_version, "SequenceAcknowledgement"));
        reply.headers.acknowledgements = vec![build_ack(rmd)];
        return Ok(Some(reply));
    }

    let now = ctx.now();
    let due = if immediate {
        now
    } else {
        now + ctx.config.acknowledgement_interval.as_millis() as u64
    };

    let pending = tx.find::<SenderBean, _>(&SenderQuery {
        sequence_id: Some(rmd.sequence_id.clone()),
        message_type: Some(MessageType::Acknowledgement),
        ..Default::default()
    })?;
    if let Some(mut existing) = pending.into_iter().next() {
        if existing.time_to_send > due as i64 {
            existing.time_to_send = due as i64;
            tx.update(existing)?;
        }
        return Ok(None);
    }

    let mut envelope = RmEnvelope::new();
    envelope.to = rmd.acks_to_epr.clone();
    envelope.action = Some(action(rmd.rm_version, "SequenceAcknowledgement"));
    envelope.headers.rm_version = rmd.rm_version;
    envelope.headers.acknowledgements = vec![build_ack(rmd)];

    let mut bean = sender_bean(&envelope, MessageType::Acknowledgement, None, due);
    bean.sequence_id = Some(rmd.sequence_id.clone());
    debug!(
        "[rm-engine] Queued acknowledgement for {} due at {}",
        rmd.sequence_id, due
    );
    queue_outbound(tx, envelope, bean)?;
    Ok(None)
}

/// Apply an inbound acknowledgement to the sending sequence it names.
pub fn handle_acknowledgement(
    ctx: &EngineContext,
    tx: &mut Transaction,
    ack: &SequenceAcknowledgement,
) -> RmResult<()> {
    let mut rms: RmsBean = tx
        .find_unique(&RmsQuery::by_sequence_id(ack.identifier.clone()))?
        .ok_or_else(|| SequenceFault::unknown_sequence(&ack.identifier))?;

    let mut acked = RangeString::new();
    for range in &ack.ranges {
        if range.lower == 0
            || range.lower > range.upper
            || range.upper > rms.highest_out_message_number
        {
            return Err(SequenceFault::new(
                FaultKind::InvalidAcknowledgement,
                Some(&ack.identifier),
                format!(
                    "range {} outside messages sent (1-{})",
                    range, rms.highest_out_message_number
                ),
            )
            .into());
        }
        acked.add_range(range.lower, range.upper);
    }

    let now = ctx.now();
    rms.last_activated_time = now;

    let newly_acked = acked.difference(&rms.client_completed_messages);
    for number in newly_acked.iter() {
        let beans = tx.find::<SenderBean, _>(&SenderQuery {
            internal_sequence_id: Some(rms.internal_sequence_id.clone()),
            message_type: Some(MessageType::Application),
            message_number: Some(number),
            ..Default::default()
        })?;
        for bean in beans {
            discard(tx, &bean.message_id)?;
        }
    }
    rms.client_completed_messages.add_all(&acked);
    if !newly_acked.is_empty() {
        debug!(
            "[rm-engine] Sequence {} acknowledged {} (total {})",
            ack.identifier, newly_acked, rms.client_completed_messages
        );
    }

    for &number in &ack.nacks {
        if number == 0
            || number > rms.highest_out_message_number
            || rms.client_completed_messages.contains(number)
        {
            continue;
        }
        let beans = tx.find::<SenderBean, _>(&SenderQuery {
            internal_sequence_id: Some(rms.internal_sequence_id.clone()),
            message_type: Some(MessageType::Application),
            message_number: Some(number),
            ..Default::default()
        })?;
        for mut bean in beans {
            bean.time_to_send = now as i64;
            tx.update(bean)?;
        }
    }

    if rms.polling_mode && !rms.all_sent_acknowledged() {
        ctx.polls.schedule(&rms.internal_sequence_id);
    }

    if rms.should_terminate() {
        termination::queue_terminate(ctx, tx, &mut rms)?;
    }
    tx.update(rms)
}

/// Answer an AckRequested with an immediate acknowledgement.
pub fn handle_ack_requested(
    ctx: &EngineContext,
    tx: &mut Transaction,
    envelope: &RmEnvelope,
    request: &AckRequested,
) -> RmResult<Option<RmEnvelope>> {
    let rmd: RmdBean = tx
        .retrieve(&request.identifier)?
        .ok_or_else(|| SequenceFault::unknown_sequence(&request.identifier))?;
    info!(
        "[rm-engine] Acknowledgement requested for {}",
        request.identifier
    );
    acknowledge(ctx, tx, &rmd, envelope, true)
}

/// Host request for an immediate acknowledgement of `internal_sequence_id`.
pub fn queue_ack_request(
    ctx: &EngineContext,
    tx: &mut Transaction,
    internal_sequence_id: &str,
) -> RmResult<()> {
    let rms: RmsBean = tx
        .retrieve(internal_sequence_id)?
        .ok_or_else(|| RmError::SequenceNotFound {
            id: internal_sequence_id.to_string(),
        })?;
    let id = || internal_sequence_id.to_string();
    if rms.timed_out {
        return Err(RmError::SequenceTimedOut { id: id() });
    }
    if rms.terminated {
        return Err(RmError::SequenceTerminated { id: id() });
    }
    let Some(sequence_id) = rms.sequence_id.clone() else {
        return Err(RmError::SequenceNotEstablished {
            internal_sequence_id: id(),
        });
    };

    let mut envelope = RmEnvelope::new();
    envelope.to = rms.to_epr.clone();
    envelope.action = Some(action(rms.rm_version, "AckRequested"));
    envelope.headers.rm_version = rms.rm_version;
    envelope.headers.ack_requested.push(AckRequested {
        identifier: sequence_id,
    });
    let bean = sender_bean(&envelope, MessageType::AckRequest, Some(&rms), ctx.now());
    queue_outbound(tx, envelope, bean)?;
    debug!("[rm-engine] AckRequested queued for {}", internal_sequence_id);
    Ok(())
}
