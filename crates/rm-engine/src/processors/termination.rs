//! CloseSequence and TerminateSequence, both directions.

use crate::domain::envelope::is_back_channel;
use crate::domain::{
    CloseSequence, CloseSequenceResponse, FaultKind, MessageType, RmEnvelope, RmdBean, RmsBean,
    RmsQuery, SenderQuery, SequenceEvent, SequenceFault, TerminateSequence,
    TerminateSequenceResponse,
};
use crate::error::{RmError, RmResult};
use crate::processors::outbound::{discard_matching, queue_outbound, sender_bean};
use crate::processors::{acknowledgement, action, EngineContext};
use crate::store::Transaction;
use tracing::{info, warn};

fn load_rms(tx: &mut Transaction, internal_sequence_id: &str) -> RmResult<RmsBean> {
    tx.retrieve(internal_sequence_id)?
        .ok_or_else(|| RmError::SequenceNotFound {
            id: internal_sequence_id.to_string(),
        })
}

/// Host request to terminate; honoured once every message is acknowledged.
pub fn request_termination(
    ctx: &EngineContext,
    tx: &mut Transaction,
    internal_sequence_id: &str,
) -> RmResult<()> {
    let mut rms = load_rms(tx, internal_sequence_id)?;
    if rms.timed_out {
        return Err(RmError::SequenceTimedOut {
            id: internal_sequence_id.to_string(),
        });
    }
    if rms.terminated || rms.terminate_added {
        return Ok(());
    }
    rms.terminate_requested = true;
    if rms.should_terminate() {
        queue_terminate(ctx, tx, &mut rms)?;
    } else {
        info!(
            "[rm-engine] Termination of {} deferred until all messages are acknowledged",
            internal_sequence_id
        );
    }
    tx.update(rms)
}

/// Queue a TerminateSequence for `rms`. The caller persists `rms`.
pub fn queue_terminate(ctx: &EngineContext, tx: &mut Transaction, rms: &mut RmsBean) -> RmResult<()> {
    let Some(sequence_id) = rms.sequence_id.clone() else {
        return Err(RmError::SequenceNotEstablished {
            internal_sequence_id: rms.internal_sequence_id.clone(),
        });
    };
    let now = ctx.now();
    let version = rms.rm_version;

    let mut envelope = RmEnvelope::new();
    envelope.to = rms.to_epr.clone();
    envelope.action = Some(action(version, "TerminateSequence"));
    envelope.headers.rm_version = version;
    envelope.headers.terminate_sequence = Some(TerminateSequence {
        identifier: sequence_id,
        last_message_number: (version.has_terminate_response()
            && rms.highest_out_message_number > 0)
            .then_some(rms.highest_out_message_number),
    });

    let mut bean = sender_bean(&envelope, MessageType::TerminateSequence, Some(rms), now);
    bean.resend = version.has_terminate_response();
    queue_outbound(tx, envelope, bean)?;

    rms.apply(SequenceEvent::TerminateQueued)?;
    rms.last_activated_time = now;
    info!(
        "[rm-engine] TerminateSequence queued for {}",
        rms.internal_sequence_id
    );
    Ok(())
}

/// Mark `rms` terminated and drop its remaining control messages.
pub fn complete_termination(
    ctx: &EngineContext,
    tx: &mut Transaction,
    rms: &mut RmsBean,
) -> RmResult<()> {
    if rms.terminated || rms.timed_out {
        return Ok(());
    }
    rms.apply(SequenceEvent::Terminate)?;
    rms.last_activated_time = ctx.now();
    for message_type in [MessageType::TerminateSequence, MessageType::CloseSequence] {
        discard_matching(
            tx,
            &SenderQuery {
                internal_sequence_id: Some(rms.internal_sequence_id.clone()),
                message_type: Some(message_type),
                ..Default::default()
            },
        )?;
    }
    info!("[rm-engine] Sequence {} terminated", rms.internal_sequence_id);
    Ok(())
}

/// Host request to close (WS-RM 1.1).
pub fn close_sequence(
    ctx: &EngineContext,
    tx: &mut Transaction,
    internal_sequence_id: &str,
) -> RmResult<()> {
    let mut rms = load_rms(tx, internal_sequence_id)?;
    if !rms.rm_version.supports_close() {
        return Err(RmError::UnsupportedOperation {
            operation: "CloseSequence".to_string(),
            version: format!("{:?}", rms.rm_version),
        });
    }
    let id = || internal_sequence_id.to_string();
    if rms.timed_out {
        return Err(RmError::SequenceTimedOut { id: id() });
    }
    if rms.terminated || rms.terminate_added {
        return Err(RmError::SequenceTerminated { id: id() });
    }
    if rms.closed {
        return Ok(());
    }
    let Some(sequence_id) = rms.sequence_id.clone() else {
        return Err(RmError::SequenceNotEstablished {
            internal_sequence_id: id(),
        });
    };

    let now = ctx.now();
    rms.apply(SequenceEvent::Close)?;
    rms.last_activated_time = now;

    let mut envelope = RmEnvelope::new();
    envelope.to = rms.to_epr.clone();
    envelope.action = Some(action(rms.rm_version, "CloseSequence"));
    envelope.headers.rm_version = rms.rm_version;
    envelope.headers.close_sequence = Some(CloseSequence {
        identifier: sequence_id,
        last_message_number: Some(rms.highest_out_message_number),
    });
    let mut bean = sender_bean(&envelope, MessageType::CloseSequence, Some(&rms), now);
    bean.resend = true;
    queue_outbound(tx, envelope, bean)?;

    info!("[rm-engine] Closing sequence {}", internal_sequence_id);
    tx.update(rms)
}

/// Send `response` on the back-channel or queue it to `request.reply_to`.
fn respond(
    tx: &mut Transaction,
    request: &RmEnvelope,
    response: RmEnvelope,
    message_type: MessageType,
    sequence_id: &str,
    now: u64,
) -> RmResult<Option<RmEnvelope>> {
    if is_back_channel(request.reply_to.as_ref()) {
        return Ok(Some(response));
    }
    let mut bean = sender_bean(&response, message_type, None, now);
    bean.sequence_id = Some(sequence_id.to_string());
    queue_outbound(tx, response, bean)?;
    Ok(None)
}

/// Inbound CloseSequence: stop accepting messages and answer with a final ack.
pub fn handle_close_sequence(
    ctx: &EngineContext,
    tx: &mut Transaction,
    envelope: &RmEnvelope,
    close: &CloseSequence,
) -> RmResult<Option<RmEnvelope>> {
    let mut rmd: RmdBean = tx
        .retrieve(&close.identifier)?
        .ok_or_else(|| SequenceFault::unknown_sequence(&close.identifier))?;
    if !rmd.rm_version.supports_close() {
        return Err(SequenceFault::new(
            FaultKind::InvalidMessage,
            Some(&close.identifier),
            "CloseSequence is not part of WS-RM 1.0",
        )
        .into());
    }
    if rmd.terminated {
        return Err(SequenceFault::new(
            FaultKind::SequenceTerminated,
            Some(&close.identifier),
            "sequence already terminated",
        )
        .into());
    }

    let now = ctx.now();
    if !rmd.closed {
        rmd.apply(SequenceEvent::Close)?;
    }
    if rmd.last_message_number.is_none() {
        rmd.last_message_number = close
            .last_message_number
            .or(Some(rmd.highest_in_message_number));
    }
    rmd.last_activated_time = now;
    tx.update(rmd.clone())?;

    let mut response = envelope.reply();
    response.action = Some(action(rmd.rm_version, "CloseSequenceResponse"));
    response.headers.close_sequence_response = Some(CloseSequenceResponse {
        identifier: rmd.sequence_id.clone(),
    });
    response.headers.acknowledgements = vec![acknowledgement::build_ack(&rmd)];
    info!("[rm-engine] Inbound sequence {} closed", rmd.sequence_id);
    respond(
        tx,
        envelope,
        response,
        MessageType::CloseSequenceResponse,
        &rmd.sequence_id,
        now,
    )
}

pub fn handle_close_sequence_response(
    ctx: &EngineContext,
    tx: &mut Transaction,
    response: &CloseSequenceResponse,
) -> RmResult<()> {
    let Some(mut rms) =
        tx.find_unique::<RmsBean, _>(&RmsQuery::by_sequence_id(response.identifier.clone()))?
    else {
        warn!(
            "[rm-engine] CloseSequenceResponse for unknown sequence {}",
            response.identifier
        );
        return Ok(());
    };
    discard_matching(
        tx,
        &SenderQuery {
            internal_sequence_id: Some(rms.internal_sequence_id.clone()),
            message_type: Some(MessageType::CloseSequence),
            ..Default::default()
        },
    )?;
    rms.last_activated_time = ctx.now();
    tx.update(rms)
}

/// Inbound TerminateSequence: end the inbound sequence and let the reverse
/// sequence terminate once its own messages are acknowledged.
pub fn handle_terminate_sequence(
    ctx: &EngineContext,
    tx: &mut Transaction,
    envelope: &RmEnvelope,
    terminate: &TerminateSequence,
) -> RmResult<Option<RmEnvelope>> {
    let linked = ctx
        .store
        .peek::<RmdBean>(&terminate.identifier)
        .and_then(|rmd| rmd.outbound_internal_sequence);
    let reverse: Option<RmsBean> = match &linked {
        Some(internal) => tx.retrieve(internal)?,
        None => None,
    };
    let mut rmd: RmdBean = tx
        .retrieve(&terminate.identifier)?
        .ok_or_else(|| SequenceFault::unknown_sequence(&terminate.identifier))?;
    if envelope.headers.rm_version != rmd.rm_version {
        return Err(SequenceFault::new(
            FaultKind::InvalidMessage,
            Some(&terminate.identifier),
            "TerminateSequence version does not match the sequence",
        )
        .into());
    }

    let now = ctx.now();
    if !rmd.terminated {
        rmd.apply(SequenceEvent::Terminate)?;
    }
    rmd.last_message_number = terminate
        .last_message_number
        .or(rmd.last_message_number)
        .or(Some(rmd.highest_in_message_number));
    rmd.last_activated_time = now;
    tx.update(rmd.clone())?;
    info!("[rm-engine] Inbound sequence {} terminated", rmd.sequence_id);

    if let Some(mut rms) = reverse {
        if !rms.state.is_terminal() && !rms.terminate_added {
            rms.terminate_requested = true;
            if rms.should_terminate() {
                queue_terminate(ctx, tx, &mut rms)?;
            }
            tx.update(rms)?;
        }
    }

    if !rmd.rm_version.has_terminate_response() {
        return Ok(None);
    }
    let mut response = envelope.reply();
    response.action = Some(action(rmd.rm_version, "TerminateSequenceResponse"));
    response.headers.terminate_sequence_response = Some(TerminateSequenceResponse {
        identifier: rmd.sequence_id.clone(),
    });
    response.headers.acknowledgements = vec![acknowledgement::build_ack(&rmd)];
    respond(
        tx,
        envelope,
        response,
        MessageType::TerminateSequenceResponse,
        &rmd.sequence_id,
        now,
    )
}

pub fn handle_terminate_sequence_response(
    ctx: &EngineContext,
    tx: &mut Transaction,
    response: &TerminateSequenceResponse,
) -> RmResult<()> {
    let Some(mut rms) =
        tx.find_unique::<RmsBean, _>(&RmsQuery::by_sequence_id(response.identifier.clone()))?
    else {
        warn!(
            "[rm-engine] TerminateSequenceResponse for unknown sequence {}",
            response.identifier
        );
        return Ok(());
    };
    complete_termination(ctx, tx, &mut rms)?;
    tx.update(rms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RmVersion, SenderBean, SequenceState};
    use crate::processors::tests::{context, established_rms, inbound_sequence};

    #[test]
    fn test_terminate_deferred_until_acknowledged() {
        let ctx = context();
        let mut rms = established_rms("int", "seq", RmVersion::V1_1);
        rms.assign_message_number();
        ctx.in_transaction(|tx| tx.insert(rms.clone())).unwrap();

        ctx.in_transaction(|tx| request_termination(&ctx, tx, "int")).unwrap();
        let stored: RmsBean = ctx.store.peek("int").unwrap();
        assert!(stored.terminate_requested);
        assert!(!stored.terminate_added);
        assert_eq!(ctx.store.counts().sender, 0);
    }

    #[test]
    fn test_terminate_queued_when_all_acked() {
        let ctx = context();
        let rms = established_rms("int", "seq", RmVersion::V1_0);
        ctx.in_transaction(|tx| tx.insert(rms.clone())).unwrap();

        ctx.in_transaction(|tx| request_termination(&ctx, tx, "int")).unwrap();
        let stored: RmsBean = ctx.store.peek("int").unwrap();
        assert_eq!(stored.state, SequenceState::Terminating);
        let beans: Vec<SenderBean> = ctx.store.snapshot(&SenderQuery::for_internal_sequence("int"));
        assert_eq!(beans[0].message_type, MessageType::TerminateSequence);
        assert!(!beans[0].resend, "WS-RM 1.0 sends TerminateSequence once");
    }

    #[test]
    fn test_close_requires_1_1() {
        let ctx = context();
        ctx.in_transaction(|tx| tx.insert(established_rms("old", "seq-old", RmVersion::V1_0)))
            .unwrap();
        let result = ctx.in_transaction(|tx| close_sequence(&ctx, tx, "old"));
        assert!(matches!(result, Err(RmError::UnsupportedOperation { .. })));

        ctx.in_transaction(|tx| tx.insert(established_rms("new", "seq-new", RmVersion::V1_1)))
            .unwrap();
        ctx.in_transaction(|tx| close_sequence(&ctx, tx, "new")).unwrap();
        assert!(ctx.store.peek::<RmsBean>("new").unwrap().closed);
    }

    #[test]
    fn test_inbound_terminate_answers_with_final_ack() {
        let ctx = context();
        inbound_sequence(&ctx, "seq", RmVersion::V1_1);
        let mut request = RmEnvelope::new();
        request.headers.rm_version = RmVersion::V1_1;
        let terminate = TerminateSequence {
            identifier: "seq".into(),
            last_message_number: Some(0),
        };

        let response = ctx
            .in_transaction(|tx| handle_terminate_sequence(&ctx, tx, &request, &terminate))
            .unwrap()
            .unwrap();
        assert!(response.headers.terminate_sequence_response.is_some());
        assert!(response.headers.acknowledgements[0].is_final);
        assert!(ctx.store.peek::<RmdBean>("seq").unwrap().terminated);
    }

    #[test]
    fn test_inbound_close_on_unknown_sequence_faults() {
        let ctx = context();
        let close = CloseSequence {
            identifier: "ghost".into(),
            last_message_number: None,
        };
        let result =
            ctx.in_transaction(|tx| handle_close_sequence(&ctx, tx, &RmEnvelope::new(), &close));
        assert_eq!(
            result.unwrap_err().fault().map(|f| f.kind),
            Some(FaultKind::UnknownSequence)
        );
    }
}
