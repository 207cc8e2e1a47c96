//! Sequence establishment: CreateSequence out, CreateSequence in,
//! CreateSequenceResponse in.

use crate::domain::envelope::{is_back_channel, new_message_id};
use crate::domain::{
    CreateSequence, CreateSequenceResponse, EndpointReference, FaultKind, MessageType, RmEnvelope,
    RmdBean, RmsBean, RmsQuery, SenderBean, SenderQuery, SequenceEvent, SequenceFault,
};
use crate::error::{RmError, RmResult};
use crate::ports::CreateSequenceRequest;
use crate::processors::outbound::{discard, queue_outbound, sender_bean};
use crate::processors::{action, termination, EngineContext};
use crate::store::Transaction;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Internal id of the reverse sequence accepted for inbound sequence `sequence_id`.
pub fn reverse_internal_id(sequence_id: &str) -> String {
    format!("reply:{}", sequence_id)
}

/// Internal id for a host request: destination plus key, or random.
pub fn internal_id_for(request: &CreateSequenceRequest) -> String {
    match &request.sequence_key {
        Some(key) => format!("{}|{}", request.to.address, key),
        None => Uuid::new_v4().to_string(),
    }
}

/// Create the sending-side record and queue the CreateSequence message.
///
/// Returns the existing internal id when a live sequence with the same key
/// already exists.
pub fn start_sequence(
    ctx: &EngineContext,
    tx: &mut Transaction,
    request: &CreateSequenceRequest,
) -> RmResult<String> {
    let internal_id = internal_id_for(request);
    if let Some(existing) = tx.retrieve::<RmsBean>(&internal_id)? {
        if existing.timed_out {
            return Err(RmError::SequenceTimedOut { id: internal_id });
        }
        if existing.state.is_terminal() {
            return Err(RmError::SequenceTerminated { id: internal_id });
        }
        debug!("[rm-engine] Reusing sequence {}", internal_id);
        return Ok(internal_id);
    }

    let now = ctx.now();
    let version = request.rm_version;
    let polling_address = request
        .polling_mode
        .then(EndpointReference::make_connection_anonymous);
    let acks_to = request
        .acks_to
        .clone()
        .or_else(|| polling_address.clone())
        .unwrap_or_else(EndpointReference::anonymous);
    let reply_to = request.reply_to.clone().or(polling_address);
    let offer = request.offer.then(new_message_id);

    let mut envelope = RmEnvelope::new();
    envelope.to = Some(request.to.clone());
    envelope.reply_to = Some(reply_to.clone().unwrap_or_else(EndpointReference::anonymous));
    envelope.action = Some(action(version, "CreateSequence"));
    envelope.headers.rm_version = version;
    envelope.headers.create_sequence = Some(CreateSequence {
        acks_to: acks_to.clone(),
        offer: offer.clone(),
        offer_endpoint: offer
            .as_ref()
            .map(|_| reply_to.clone().unwrap_or_else(EndpointReference::anonymous)),
    });

    let mut rms = RmsBean::new(&internal_id, envelope.message_id.clone(), version, now);
    rms.to_epr = Some(request.to.clone());
    rms.reply_to_epr = reply_to;
    rms.acks_to_epr = Some(acks_to);
    rms.polling_mode = request.polling_mode;
    rms.avoid_auto_termination = request.avoid_auto_termination;
    rms.offered_sequence = offer;
    tx.insert(rms.clone())?;

    let mut bean = sender_bean(&envelope, MessageType::CreateSequence, Some(&rms), now);
    bean.resend = true;
    queue_outbound(tx, envelope, bean)?;

    info!(
        "[rm-engine] Creating sequence {} to {}",
        internal_id, request.to.address
    );
    Ok(internal_id)
}

/// Accept an inbound CreateSequence.
///
/// The response goes on the back-channel when reply-to is anonymous and is
/// queued otherwise. An offer is accepted unless its id is already in use.
pub fn handle_create_sequence(
    ctx: &EngineContext,
    tx: &mut Transaction,
    envelope: &RmEnvelope,
    create: &CreateSequence,
) -> RmResult<Option<RmEnvelope>> {
    let now = ctx.now();
    let version = envelope.headers.rm_version;
    let sequence_id = new_message_id();

    let mut rmd = RmdBean::new(&sequence_id, version, now);
    rmd.apply(SequenceEvent::Establish)?;
    rmd.acks_to_epr = Some(create.acks_to.clone());
    rmd.reply_to_epr = envelope.reply_to.clone();

    let mut accept = None;
    if let Some(offered) = &create.offer {
        let in_use = !tx
            .find::<RmsBean, _>(&RmsQuery::by_sequence_id(offered.clone()))?
            .is_empty()
            || ctx.store.peek::<RmdBean>(offered).is_some();
        if in_use {
            return Err(SequenceFault::new(
                FaultKind::CreateSequenceRefused,
                Some(offered),
                "offered sequence id is already in use",
            )
            .into());
        }

        let internal = reverse_internal_id(&sequence_id);
        let mut reverse = RmsBean::new(&internal, envelope.message_id.clone(), version, now);
        reverse.sequence_id = Some(offered.clone());
        reverse.apply(SequenceEvent::Establish)?;
        reverse.to_epr = create
            .offer_endpoint
            .clone()
            .or_else(|| envelope.reply_to.clone());
        reverse.acks_to_epr = envelope.to.clone();
        tx.insert(reverse)?;

        rmd.outbound_internal_sequence = Some(internal);
        accept = Some(
            envelope
                .to
                .clone()
                .unwrap_or_else(EndpointReference::anonymous),
        );
        info!(
            "[rm-engine] Accepted offered sequence {} for replies on {}",
            offered, sequence_id
        );
    }
    tx.insert(rmd)?;

    let mut response = envelope.reply();
    response.action = Some(action(version, "CreateSequenceResponse"));
    response.headers.create_sequence_response = Some(CreateSequenceResponse {
        identifier: sequence_id.clone(),
        accept,
    });
    info!("[rm-engine] Created inbound sequence {}", sequence_id);

    if is_back_channel(envelope.reply_to.as_ref()) {
        return Ok(Some(response));
    }
    let mut bean = sender_bean(&response, MessageType::CreateSequenceResponse, None, now);
    bean.sequence_id = Some(sequence_id);
    queue_outbound(tx, response, bean)?;
    Ok(None)
}

/// Bind the negotiated id and release messages held back while creating.
pub fn handle_create_sequence_response(
    ctx: &EngineContext,
    tx: &mut Transaction,
    envelope: &RmEnvelope,
    response: &CreateSequenceResponse,
) -> RmResult<()> {
    let Some(relates_to) = envelope.relates_to.as_deref() else {
        return Err(SequenceFault::new(
            FaultKind::InvalidMessage,
            Some(&response.identifier),
            "CreateSequenceResponse without RelatesTo",
        )
        .into());
    };
    let Some(mut rms) = tx.find_unique::<RmsBean, _>(&RmsQuery::by_create_seq_msg_id(relates_to))?
    else {
        warn!(
            "[rm-engine] No sequence waiting for CreateSequenceResponse {}",
            relates_to
        );
        return Ok(());
    };
    if rms.sequence_id.is_some() || rms.state.is_terminal() {
        debug!(
            "[rm-engine] Ignoring repeated CreateSequenceResponse for {}",
            rms.internal_sequence_id
        );
        return Ok(());
    }

    let now = ctx.now();
    rms.sequence_id = Some(response.identifier.clone());
    rms.apply(SequenceEvent::Establish)?;
    rms.last_activated_time = now;

    if let (Some(accept), Some(offered)) = (&response.accept, &rms.offered_sequence) {
        if tx.retrieve::<RmdBean>(offered)?.is_none() {
            let mut rmd = RmdBean::new(offered, rms.rm_version, now);
            rmd.apply(SequenceEvent::Establish)?;
            rmd.acks_to_epr = Some(accept.clone());
            rmd.polling_mode = rms.polling_mode;
            rmd.outbound_internal_sequence = Some(rms.internal_sequence_id.clone());
            tx.insert(rmd)?;
        }
    }

    discard(tx, &rms.create_seq_msg_id)?;
    let held = tx.find::<SenderBean, _>(&SenderQuery {
        internal_sequence_id: Some(rms.internal_sequence_id.clone()),
        send: Some(false),
        ..Default::default()
    })?;
    let released = held.len();
    for mut bean in held {
        bean.sequence_id = rms.sequence_id.clone();
        bean.send = true;
        bean.time_to_send = now as i64;
        tx.update(bean)?;
    }

    if rms.should_terminate() {
        termination::queue_terminate(ctx, tx, &mut rms)?;
    }
    info!(
        "[rm-engine] Sequence {} established as {} ({} held messages released)",
        rms.internal_sequence_id, response.identifier, released
    );
    tx.update(rms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RmVersion, SequenceState};
    use crate::processors::tests::context;

    fn request() -> CreateSequenceRequest {
        CreateSequenceRequest::new(EndpointReference::new("http://server/rm"))
    }

    #[test]
    fn test_start_sequence_queues_create_sequence() {
        let ctx = context();
        let id = ctx.in_transaction(|tx| start_sequence(&ctx, tx, &request())).unwrap();

        let rms: RmsBean = ctx.store.peek(&id).unwrap();
        assert_eq!(rms.state, SequenceState::Creating);
        let beans: Vec<SenderBean> = ctx.store.snapshot(&SenderQuery::for_internal_sequence(&id));
        assert_eq!(beans.len(), 1);
        assert_eq!(beans[0].message_type, MessageType::CreateSequence);
        assert_eq!(beans[0].message_id, rms.create_seq_msg_id);
        assert!(beans[0].resend);
    }

    #[test]
    fn test_keyed_sequence_is_reused() {
        let ctx = context();
        let mut keyed = request();
        keyed.sequence_key = Some("orders".into());
        let first = ctx.in_transaction(|tx| start_sequence(&ctx, tx, &keyed)).unwrap();
        let second = ctx.in_transaction(|tx| start_sequence(&ctx, tx, &keyed)).unwrap();
        assert_eq!(first, second);
        assert_eq!(ctx.store.counts().rms, 1);
    }

    #[test]
    fn test_create_sequence_with_offer_builds_reverse_sequence() {
        let ctx = context();
        let mut cs = RmEnvelope::new();
        cs.to = Some(EndpointReference::new("http://server/rm"));
        cs.headers.rm_version = RmVersion::V1_1;
        let create = CreateSequence {
            acks_to: EndpointReference::anonymous(),
            offer: Some("urn:offered".into()),
            offer_endpoint: Some(EndpointReference::new("http://client/rm")),
        };

        let response = ctx
            .in_transaction(|tx| handle_create_sequence(&ctx, tx, &cs, &create))
            .unwrap()
            .expect("anonymous reply-to answers on the back-channel");
        let csr = response.headers.create_sequence_response.unwrap();
        assert_eq!(csr.accept, Some(EndpointReference::new("http://server/rm")));

        let rmd: RmdBean = ctx.store.peek(&csr.identifier).unwrap();
        assert_eq!(rmd.state, SequenceState::Established);
        let reverse_id = rmd.outbound_internal_sequence.unwrap();
        let reverse: RmsBean = ctx.store.peek(&reverse_id).unwrap();
        assert_eq!(reverse.sequence_id.as_deref(), Some("urn:offered"));
        assert_eq!(reverse.to_epr, Some(EndpointReference::new("http://client/rm")));

        let again = ctx.in_transaction(|tx| handle_create_sequence(&ctx, tx, &cs, &create));
        assert_eq!(
            again.unwrap_err().fault().map(|f| f.kind),
            Some(FaultKind::CreateSequenceRefused)
        );
    }

    #[test]
    fn test_response_releases_held_messages() {
        let ctx = context();
        let id = ctx.in_transaction(|tx| start_sequence(&ctx, tx, &request())).unwrap();
        ctx.in_transaction(|tx| {
            crate::processors::application::send_application_message(
                &ctx,
                tx,
                &id,
                b"hello".to_vec(),
                &Default::default(),
            )
        })
        .unwrap();

        let rms: RmsBean = ctx.store.peek(&id).unwrap();
        let mut csr = RmEnvelope::new().with_relates_to(rms.create_seq_msg_id.clone());
        let response = CreateSequenceResponse {
            identifier: "urn:seq:1".into(),
            accept: None,
        };
        csr.headers.create_sequence_response = Some(response.clone());
        ctx.in_transaction(|tx| handle_create_sequence_response(&ctx, tx, &csr, &response))
            .unwrap();

        let rms: RmsBean = ctx.store.peek(&id).unwrap();
        assert_eq!(rms.state, SequenceState::Established);
        let beans: Vec<SenderBean> = ctx.store.snapshot(&SenderQuery::for_internal_sequence(&id));
        assert_eq!(beans.len(), 1, "CreateSequence record removed");
        assert!(beans[0].send);
        assert_eq!(beans[0].sequence_id.as_deref(), Some("urn:seq:1"));
    }
}
