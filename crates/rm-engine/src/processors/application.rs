//! Application messages: numbering on the way out, validation and
//! duplicate detection on the way in.

use crate::domain::{
    FaultKind, InvokerBean, MessageType, RmEnvelope, RmdBean, RmsBean, SequenceFault,
    SequenceHeader, HELD_BACK, MAX_MESSAGE_NUMBER,
};
use crate::error::{RmError, RmResult};
use crate::ports::SendOptions;
use crate::processors::outbound::{new_store_key, queue_outbound, sender_bean};
use crate::processors::{acknowledgement, EngineContext};
use crate::store::Transaction;
use tracing::{debug, info};

/// Number `payload` on the sending sequence and queue it for transmission.
///
/// Until the sequence id is negotiated the message is stored but held back.
pub fn send_application_message(
    ctx: &EngineContext,
    tx: &mut Transaction,
    internal_sequence_id: &str,
    payload: Vec<u8>,
    options: &SendOptions,
) -> RmResult<u64> {
    let mut rms: RmsBean =
        tx.retrieve(internal_sequence_id)?
            .ok_or_else(|| RmError::SequenceNotFound {
                id: internal_sequence_id.to_string(),
            })?;
    let id = || internal_sequence_id.to_string();
    if rms.timed_out {
        return Err(RmError::SequenceTimedOut { id: id() });
    }
    if rms.terminated || rms.terminate_added {
        return Err(RmError::SequenceTerminated { id: id() });
    }
    if rms.closed || rms.last_message_sent {
        return Err(RmError::SequenceClosed { id: id() });
    }
    if rms.next_message_number >= MAX_MESSAGE_NUMBER {
        return Err(SequenceFault::new(
            FaultKind::MessageNumberRollover,
            rms.sequence_id.as_deref(),
            "no message numbers left",
        )
        .into());
    }

    let now = ctx.now();
    let number = rms.assign_message_number();
    let established = rms.sequence_id.is_some();

    let mut envelope = RmEnvelope::application(rms.to_epr.clone(), payload);
    envelope.action = options.action.clone();
    if options.expects_reply || rms.offered_sequence.is_some() {
        envelope.reply_to = rms.reply_to_epr.clone();
    }
    envelope.headers.rm_version = rms.rm_version;
    envelope.headers.sequence = Some(SequenceHeader {
        identifier: rms.sequence_id.clone().unwrap_or_default(),
        message_number: number,
        last_message: options.last_message && !rms.rm_version.supports_close(),
    });

    let mut bean = sender_bean(&envelope, MessageType::Application, Some(&rms), now);
    bean.message_number = number;
    bean.resend = true;
    bean.last_message = options.last_message;
    if !established {
        bean.send = false;
        bean.time_to_send = HELD_BACK;
    }
    queue_outbound(tx, envelope, bean)?;

    if options.last_message {
        rms.last_message_sent = true;
    }
    if options.expects_reply {
        rms.expected_replies += 1;
    }
    rms.last_activated_time = now;
    tx.update(rms)?;

    debug!(
        "[rm-engine] Queued message {} on {}{}",
        number,
        internal_sequence_id,
        if established { "" } else { " (held until established)" }
    );
    Ok(number)
}

/// Inbound message carrying a `Sequence` header.
pub fn handle_sequence(
    ctx: &EngineContext,
    tx: &mut Transaction,
    envelope: &RmEnvelope,
    sequence: &SequenceHeader,
) -> RmResult<Option<RmEnvelope>> {
    receive(
        ctx,
        tx,
        &sequence.identifier,
        sequence.message_number,
        sequence.last_message,
        envelope,
    )
}

/// Accept message `number` of inbound sequence `sequence_id`.
///
/// Duplicates and numbers below the delivery window are acknowledged again
/// but not handed to the invoker.
pub fn receive(
    ctx: &EngineContext,
    tx: &mut Transaction,
    sequence_id: &str,
    number: u64,
    last_message: bool,
    envelope: &RmEnvelope,
) -> RmResult<Option<RmEnvelope>> {
    let linked = ctx
        .store
        .peek::<RmdBean>(sequence_id)
        .and_then(|rmd| rmd.outbound_internal_sequence);
    let mut reverse: Option<RmsBean> = match &linked {
        Some(internal) => tx.retrieve(internal)?,
        None => None,
    };
    let mut rmd: RmdBean = tx
        .retrieve(sequence_id)?
        .ok_or_else(|| SequenceFault::unknown_sequence(sequence_id))?;

    let fault = |kind: FaultKind, detail: String| -> RmError {
        SequenceFault::new(kind, Some(sequence_id), detail).into()
    };
    if envelope.headers.rm_version != rmd.rm_version {
        return Err(fault(
            FaultKind::InvalidMessage,
            format!(
                "message uses {:?} but the sequence was created with {:?}",
                envelope.headers.rm_version, rmd.rm_version
            ),
        ));
    }
    if number == 0 {
        return Err(fault(
            FaultKind::InvalidMessage,
            "message numbers start at 1".to_string(),
        ));
    }
    if rmd.terminated {
        return Err(fault(
            FaultKind::SequenceTerminated,
            format!("message {} arrived after termination", number),
        ));
    }
    if rmd.closed {
        return Err(fault(
            FaultKind::SequenceClosed,
            format!("message {} arrived after close", number),
        ));
    }
    if number >= MAX_MESSAGE_NUMBER {
        return Err(fault(
            FaultKind::MessageNumberRollover,
            format!("message number {}", number),
        ));
    }
    if let Some(last) = rmd.last_message_number {
        if number > last {
            return Err(fault(
                FaultKind::LastMessageNumberExceeded,
                format!("message {} after last message {}", number, last),
            ));
        }
    }

    let now = ctx.now();
    rmd.last_activated_time = now;
    let duplicate = rmd.server_completed_messages.contains(number);
    if duplicate {
        info!(
            "[rm-engine] Duplicate message {} on {}; acknowledging again",
            number, sequence_id
        );
    } else {
        rmd.server_completed_messages.add(number);
        let deliverable =
            number >= rmd.next_msg_no_to_process || rmd.is_out_of_order_allowed(number);
        if deliverable {
            let key = new_store_key();
            tx.store_message(&key, envelope.clone())?;
            tx.insert(InvokerBean {
                message_store_key: key,
                sequence_id: sequence_id.to_string(),
                message_number: number,
            })?;
        } else {
            debug!(
                "[rm-engine] Message {} on {} is below the delivery window",
                number, sequence_id
            );
        }
        if number > rmd.highest_in_message_number {
            rmd.highest_in_message_number = number;
            rmd.highest_in_message_id = Some(envelope.message_id.clone());
        }
        rmd.last_in_message_id = Some(envelope.message_id.clone());
        if last_message {
            rmd.last_message_number = Some(number);
        }
        if let Some(rms) = reverse.as_mut() {
            if rms.expected_replies > 0 {
                rms.expected_replies -= 1;
                tx.update(rms.clone())?;
            }
        }
    }

    let ack_requested = envelope
        .headers
        .ack_requested
        .iter()
        .any(|request| request.identifier == sequence_id);
    let immediate =
        duplicate || ack_requested || last_message || rmd.last_message_number == Some(number);
    tx.update(rmd.clone())?;
    acknowledgement::acknowledge(ctx, tx, &rmd, envelope, immediate)
}
