//! # Message Processors
//!
//! One module per WS-RM exchange. Every processor runs inside the caller's
//! [`Transaction`]; [`dispatch`] owns the transaction for inbound messages.
//!
//! | Element | Module |
//! |---------|--------|
//! | CreateSequence / CreateSequenceResponse | `create_sequence` |
//! | Sequence | `application` |
//! | SequenceAcknowledgement / AckRequested | `acknowledgement` |
//! | CloseSequence / TerminateSequence and their responses | `termination` |
//! | MakeConnection | `make_connection` |
//! | SequenceFault | this module |
//!
//! ## Lock Order
//!
//! Processors enlist beans in the order RMS → RMD → pending-send →
//! pending-invoke. A processor that discovers a record of an earlier kind
//! late reads it with `StorageManager::peek` first and locks in order.

pub mod acknowledgement;
pub mod application;
pub mod create_sequence;
pub mod make_connection;
pub mod outbound;
pub mod termination;

use crate::config::RmConfig;
use crate::domain::{
    FaultKind, RmEnvelope, RmVersion, RmsQuery, SequenceEvent, SequenceFault,
    SequenceAcknowledgement, Timestamp,
};
use crate::error::{RmError, RmResult};
use crate::ports::TimeSource;
use crate::store::{StorageManager, Transaction};
use crate::workers::polling::PollSchedule;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Attempts made by [`dispatch`] when its transaction loses a deadlock.
const DEADLOCK_RETRIES: usize = 3;

/// Everything a processor or worker needs besides its transaction.
pub struct EngineContext {
    pub store: StorageManager,
    pub config: RmConfig,
    pub clock: Arc<dyn TimeSource>,
    pub polls: PollSchedule,
}

impl EngineContext {
    pub fn new(config: RmConfig, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            store: StorageManager::new(),
            config,
            clock,
            polls: PollSchedule::default(),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Run `f` in a fresh transaction: commit on `Ok`, roll back on `Err`.
    pub fn in_transaction<T, F>(&self, f: F) -> RmResult<T>
    where
        F: FnOnce(&mut Transaction) -> RmResult<T>,
    {
        let mut tx = self.store.begin()?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("counts", &self.store.counts())
            .finish()
    }
}

/// WS-RM action URI for `name` under `version`.
pub fn action(version: RmVersion, name: &str) -> String {
    format!("{}/{}", version.namespace(), name)
}

/// Process one inbound message and return the back-channel response.
///
/// Protocol faults roll the transaction back and come back as a fault
/// envelope; other errors are returned to the caller.
pub fn dispatch(ctx: &EngineContext, envelope: RmEnvelope) -> RmResult<Option<RmEnvelope>> {
    if envelope.headers.is_empty() {
        debug!(
            "[rm-engine] Message {} carries no RM headers",
            envelope.message_id
        );
        return Ok(None);
    }

    let mut attempt = 1;
    loop {
        let mut tx = ctx.store.begin()?;
        match route(ctx, &mut tx, &envelope) {
            Ok(response) => {
                tx.commit()?;
                return Ok(response);
            }
            Err(RmError::Protocol(fault)) => {
                tx.rollback();
                warn!(
                    "[rm-engine] Fault for message {}: {}",
                    envelope.message_id, fault
                );
                return Ok(Some(fault.to_envelope(&envelope)));
            }
            Err(err) if err.is_deadlock() && attempt < DEADLOCK_RETRIES => {
                tx.rollback();
                debug!(
                    "[rm-engine] Retrying message {} after deadlock (attempt {})",
                    envelope.message_id, attempt
                );
                attempt += 1;
            }
            Err(err) => {
                tx.rollback();
                return Err(err);
            }
        }
    }
}

fn route(
    ctx: &EngineContext,
    tx: &mut Transaction,
    envelope: &RmEnvelope,
) -> RmResult<Option<RmEnvelope>> {
    let headers = &envelope.headers;
    let mut response = None;

    if let Some(fault) = &headers.sequence_fault {
        handle_fault(ctx, tx, envelope, fault)?;
    }
    if let Some(cs) = &headers.create_sequence {
        let reply = create_sequence::handle_create_sequence(ctx, tx, envelope, cs)?;
        response = merge_responses(response, reply);
    }
    if let Some(csr) = &headers.create_sequence_response {
        create_sequence::handle_create_sequence_response(ctx, tx, envelope, csr)?;
    }
    for ack in &headers.acknowledgements {
        acknowledgement::handle_acknowledgement(ctx, tx, ack)?;
    }
    if let Some(sequence) = &headers.sequence {
        let reply = application::handle_sequence(ctx, tx, envelope, sequence)?;
        response = merge_responses(response, reply);
    }
    for request in &headers.ack_requested {
        // Already answered by the Sequence processor.
        if headers
            .sequence
            .as_ref()
            .is_some_and(|s| s.identifier == request.identifier)
        {
            continue;
        }
        let reply = acknowledgement::handle_ack_requested(ctx, tx, envelope, request)?;
        response = merge_responses(response, reply);
    }
    if let Some(close) = &headers.close_sequence {
        let reply = termination::handle_close_sequence(ctx, tx, envelope, close)?;
        response = merge_responses(response, reply);
    }
    if let Some(closed) = &headers.close_sequence_response {
        termination::handle_close_sequence_response(ctx, tx, closed)?;
    }
    if let Some(terminate) = &headers.terminate_sequence {
        let reply = termination::handle_terminate_sequence(ctx, tx, envelope, terminate)?;
        response = merge_responses(response, reply);
    }
    if let Some(terminated) = &headers.terminate_sequence_response {
        termination::handle_terminate_sequence_response(ctx, tx, terminated)?;
    }
    if let Some(poll) = &headers.make_connection {
        let reply = make_connection::handle_make_connection(ctx, tx, envelope, poll)?;
        response = merge_responses(response, reply);
    }

    Ok(response)
}

/// Record a fault raised by the peer against one of our sending sequences.
fn handle_fault(
    ctx: &EngineContext,
    tx: &mut Transaction,
    envelope: &RmEnvelope,
    fault: &SequenceFault,
) -> RmResult<()> {
    let now = ctx.now();
    let rms = match (fault.kind, &envelope.relates_to, &fault.identifier) {
        (FaultKind::CreateSequenceRefused, Some(cs_id), _) => {
            tx.find_unique(&RmsQuery::by_create_seq_msg_id(cs_id.clone()))?
        }
        (_, _, Some(id)) => tx.find_unique(&RmsQuery::by_sequence_id(id.clone()))?,
        _ => None,
    };
    let Some(mut rms) = rms else {
        warn!("[rm-engine] Fault matches no sending sequence: {}", fault);
        return Ok(());
    };

    rms.record_send_error(fault.to_string(), now);
    let fatal = matches!(
        fault.kind,
        FaultKind::UnknownSequence
            | FaultKind::SequenceTerminated
            | FaultKind::CreateSequenceRefused
    );
    if fatal && !rms.state.is_terminal() {
        rms.apply(SequenceEvent::Terminate)?;
        rms.last_activated_time = now;
        error!(
            "[rm-engine] Sequence {} terminated by peer fault: {}",
            rms.internal_sequence_id, fault
        );
    }
    tx.update(rms)
}

/// Combine two back-channel responses into one message.
///
/// The message carrying a payload or a `Sequence` header is kept as the base;
/// control elements of the other one are folded in. Acknowledgements for the
/// same sequence keep the later, wider one.
pub fn merge_responses(
    current: Option<RmEnvelope>,
    next: Option<RmEnvelope>,
) -> Option<RmEnvelope> {
    let (current, next) = match (current, next) {
        (None, other) | (other, None) => return other,
        (Some(current), Some(next)) => (current, next),
    };
    let carries_message = |e: &RmEnvelope| !e.payload.is_empty() || e.headers.sequence.is_some();
    let (mut base, mut extra) = if carries_message(&next) && !carries_message(&current) {
        (next, current)
    } else {
        (current, next)
    };

    for ack in std::mem::take(&mut extra.headers.acknowledgements) {
        merge_ack(&mut base.headers.acknowledgements, ack);
    }
    let headers = &mut base.headers;
    let extra_headers = extra.headers;
    headers.create_sequence_response = headers
        .create_sequence_response
        .take()
        .or(extra_headers.create_sequence_response);
    headers.close_sequence_response = headers
        .close_sequence_response
        .take()
        .or(extra_headers.close_sequence_response);
    headers.terminate_sequence_response = headers
        .terminate_sequence_response
        .take()
        .or(extra_headers.terminate_sequence_response);
    headers.sequence_fault = headers.sequence_fault.take().or(extra_headers.sequence_fault);
    Some(base)
}

fn merge_ack(acks: &mut Vec<SequenceAcknowledgement>, ack: SequenceAcknowledgement) {
    match acks.iter_mut().find(|a| a.identifier == ack.identifier) {
        Some(existing) => {
            let width = |a: &SequenceAcknowledgement| a.ranges.iter().map(|r| r.len()).sum::<u64>();
            if width(&ack) >= width(existing) {
                *existing = ack;
            }
        }
        None => acks.push(ack),
    }
}

#[cfg(test)]
mod tests;
