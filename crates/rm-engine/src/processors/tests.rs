//! # Processor Tests
//!
//! Shared fixtures plus end-to-end checks of [`dispatch`].

use super::*;
use crate::domain::{
    AckRequested, EndpointReference, MessageRange, RmdBean, RmsBean, SenderBean, SenderQuery,
    SequenceHeader, SequenceState,
};
use crate::ports::MockTimeSource;

pub(crate) const NOW: u64 = 1_000_000;

pub(crate) fn context() -> EngineContext {
    EngineContext::new(RmConfig::for_testing(), Arc::new(MockTimeSource::new(NOW)))
}

/// Established inbound sequence with an anonymous acks-to.
pub(crate) fn inbound_sequence(ctx: &EngineContext, id: &str, version: RmVersion) {
    let mut rmd = RmdBean::new(id, version, NOW);
    rmd.apply(SequenceEvent::Establish).unwrap();
    ctx.in_transaction(|tx| tx.insert(rmd.clone())).unwrap();
}

pub(crate) fn established_rms(internal: &str, sequence_id: &str, version: RmVersion) -> RmsBean {
    let mut rms = RmsBean::new(internal, format!("cs-{}", internal), version, NOW);
    rms.sequence_id = Some(sequence_id.to_string());
    rms.to_epr = Some(EndpointReference::new("http://server/rm"));
    rms.apply(SequenceEvent::Establish).unwrap();
    rms
}

pub(crate) fn message(version: RmVersion) -> RmEnvelope {
    let mut envelope = RmEnvelope::application(None, b"payload".to_vec());
    envelope.headers.rm_version = version;
    envelope
}

fn sequence_message(id: &str, number: u64) -> RmEnvelope {
    let mut envelope = message(RmVersion::V1_1);
    envelope.headers.sequence = Some(SequenceHeader {
        identifier: id.to_string(),
        message_number: number,
        last_message: false,
    });
    envelope
}

fn ack(id: &str, lower: u64, upper: u64) -> SequenceAcknowledgement {
    SequenceAcknowledgement {
        identifier: id.to_string(),
        ranges: vec![MessageRange::new(lower, upper).unwrap()],
        nacks: Vec::new(),
        is_final: false,
    }
}

#[test]
fn test_dispatch_without_rm_headers_is_ignored() {
    let ctx = context();
    assert!(dispatch(&ctx, RmEnvelope::new()).unwrap().is_none());
}

#[test]
fn test_dispatch_turns_protocol_errors_into_fault_messages() {
    let ctx = context();
    let request = sequence_message("ghost", 1);

    let response = dispatch(&ctx, request.clone()).unwrap().unwrap();
    let fault = response.headers.sequence_fault.unwrap();
    assert_eq!(fault.kind, FaultKind::UnknownSequence);
    assert_eq!(response.relates_to.as_deref(), Some(request.message_id.as_str()));
    assert!(!ctx.store.has_active_transaction());
}

#[test]
fn test_fault_rolls_back_earlier_elements() {
    let ctx = context();
    inbound_sequence(&ctx, "seq", RmVersion::V1_1);

    // Valid Sequence header followed by an ack naming an unknown sequence.
    let mut request = sequence_message("seq", 1);
    request.headers.acknowledgements.push(ack("ghost", 1, 1));

    let response = dispatch(&ctx, request).unwrap().unwrap();
    assert!(response.headers.sequence_fault.is_some());
    assert!(ctx.store.peek::<RmdBean>("seq").unwrap().server_completed_messages.is_empty());
    assert_eq!(ctx.store.counts().invoker, 0);
}

#[test]
fn test_ack_and_ack_request_share_one_response() {
    let ctx = context();
    inbound_sequence(&ctx, "in", RmVersion::V1_1);
    inbound_sequence(&ctx, "other", RmVersion::V1_1);

    let mut request = sequence_message("in", 1);
    request.headers.ack_requested.push(AckRequested {
        identifier: "in".into(),
    });
    request.headers.ack_requested.push(AckRequested {
        identifier: "other".into(),
    });

    let response = dispatch(&ctx, request).unwrap().unwrap();
    let ids: Vec<&str> = response
        .headers
        .acknowledgements
        .iter()
        .map(|a| a.identifier.as_str())
        .collect();
    assert_eq!(ids, vec!["in", "other"]);
}

#[test]
fn test_inbound_ack_releases_messages_and_is_idempotent() {
    let ctx = context();
    let mut rms = established_rms("int", "seq", RmVersion::V1_1);
    ctx.in_transaction(|tx| {
        tx.insert(rms.clone())?;
        Ok(())
    })
    .unwrap();
    for payload in [b"a", b"b", b"c"] {
        ctx.in_transaction(|tx| {
            application::send_application_message(&ctx, tx, "int", payload.to_vec(), &Default::default())
        })
        .unwrap();
    }

    let mut request = RmEnvelope::new();
    request.headers.acknowledgements.push(ack("seq", 1, 2));
    for _ in 0..2 {
        assert!(dispatch(&ctx, request.clone()).unwrap().is_none());
    }

    rms = ctx.store.peek("int").unwrap();
    assert_eq!(rms.client_completed_messages.to_string(), "1-2");
    let pending: Vec<SenderBean> = ctx.store.snapshot(&SenderQuery::for_internal_sequence("int"));
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_number, 3);
    assert_eq!(ctx.store.counts().messages, 1);
}

#[test]
fn test_ack_beyond_highest_sent_is_invalid() {
    let ctx = context();
    let mut rms = established_rms("int", "seq", RmVersion::V1_1);
    rms.assign_message_number();
    ctx.in_transaction(|tx| tx.insert(rms.clone())).unwrap();

    let mut request = RmEnvelope::new();
    request.headers.acknowledgements.push(ack("seq", 1, 4));
    let response = dispatch(&ctx, request).unwrap().unwrap();
    assert_eq!(
        response.headers.sequence_fault.map(|f| f.kind),
        Some(FaultKind::InvalidAcknowledgement)
    );
}

#[test]
fn test_last_ack_triggers_auto_termination() {
    let ctx = context();
    ctx.in_transaction(|tx| tx.insert(established_rms("int", "seq", RmVersion::V1_1)))
        .unwrap();
    let options = crate::ports::SendOptions {
        last_message: true,
        ..Default::default()
    };
    ctx.in_transaction(|tx| application::send_application_message(&ctx, tx, "int", vec![1], &options))
        .unwrap();

    let mut request = RmEnvelope::new();
    request.headers.acknowledgements.push(ack("seq", 1, 1));
    dispatch(&ctx, request).unwrap();

    let rms: RmsBean = ctx.store.peek("int").unwrap();
    assert_eq!(rms.state, SequenceState::Terminating);
    let pending: Vec<SenderBean> = ctx.store.snapshot(&SenderQuery::for_internal_sequence("int"));
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_type, crate::domain::MessageType::TerminateSequence);
}

#[test]
fn test_peer_fault_terminates_sending_sequence() {
    let ctx = context();
    ctx.in_transaction(|tx| tx.insert(established_rms("int", "seq", RmVersion::V1_1)))
        .unwrap();

    let mut request = RmEnvelope::new();
    request.headers.sequence_fault = Some(SequenceFault::unknown_sequence("seq"));
    assert!(dispatch(&ctx, request).unwrap().is_none());

    let rms: RmsBean = ctx.store.peek("int").unwrap();
    assert!(rms.terminated);
    assert!(rms.last_send_error.unwrap().contains("UnknownSequence"));
}

#[test]
fn test_merge_keeps_message_as_base_and_widest_ack() {
    let mut with_payload = message(RmVersion::V1_1);
    with_payload.headers.acknowledgements.push(ack("a", 1, 1));
    let mut ack_only = RmEnvelope::new();
    ack_only.headers.acknowledgements.push(ack("a", 1, 3));
    ack_only.headers.acknowledgements.push(ack("b", 1, 1));

    let merged = merge_responses(Some(ack_only), Some(with_payload.clone())).unwrap();
    assert_eq!(merged.message_id, with_payload.message_id);
    assert_eq!(merged.headers.acknowledgements.len(), 2);
    assert_eq!(
        merged.headers.acknowledgements[0].ranges,
        vec![MessageRange::new(1, 3).unwrap()]
    );
    assert!(merge_responses(None, None).is_none());
}
