//! # Service Tests
//!
//! Two engines joined by a [`LoopbackNetwork`], driven pass by pass.

use super::*;
use crate::adapters::{LoopbackNetwork, RecordingDeliverer, ScriptedTransport};
use crate::domain::{CreateSequence, EndpointReference, RmVersion};
use crate::ports::MockTimeSource;

const SERVER: &str = "http://server/rm";

struct Pair {
    client: RmEngine,
    server: RmEngine,
    server_inbox: Arc<RecordingDeliverer>,
}

fn pair() -> Pair {
    let network = LoopbackNetwork::new();
    let clock = Arc::new(MockTimeSource::new(1_000));
    let client = RmEngine::with_time_source(
        RmConfig::for_testing(),
        Arc::new(network.transport()),
        Arc::new(RecordingDeliverer::new()),
        clock.clone(),
    )
    .unwrap();
    let server_inbox = Arc::new(RecordingDeliverer::new());
    let server = RmEngine::with_time_source(
        RmConfig::for_testing(),
        Arc::new(network.transport()),
        server_inbox.clone(),
        clock,
    )
    .unwrap();
    network.register(SERVER, server.context());
    Pair {
        client,
        server,
        server_inbox,
    }
}

fn standalone() -> RmEngine {
    RmEngine::with_time_source(
        RmConfig::for_testing(),
        Arc::new(ScriptedTransport::new()),
        Arc::new(RecordingDeliverer::new()),
        Arc::new(MockTimeSource::new(0)),
    )
    .unwrap()
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = RmConfig {
        retransmission_interval: Duration::ZERO,
        ..RmConfig::for_testing()
    };
    let result = RmEngine::new(
        config,
        Arc::new(ScriptedTransport::new()),
        Arc::new(RecordingDeliverer::new()),
    );
    assert!(matches!(result, Err(RmError::Config { .. })));
}

#[tokio::test]
async fn test_unknown_sequence_status() {
    let engine = standalone();
    let report = engine.sequence_status("nope").await.unwrap();
    assert_eq!(report.status, SequenceStatus::Unknown);
    assert!(report.state.is_none());
    assert!(matches!(
        engine.last_send_error("nope").await,
        Err(RmError::SequenceNotFound { .. })
    ));
}

#[tokio::test]
async fn test_send_is_acknowledged_and_delivered() {
    let p = pair();
    let internal = p
        .client
        .create_sequence(CreateSequenceRequest::new(EndpointReference::new(SERVER)))
        .await
        .unwrap();
    let number = p
        .client
        .send(&internal, b"hello".to_vec(), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(number, 1);
    assert_eq!(
        p.client.sequence_status(&internal).await.unwrap().status,
        SequenceStatus::Unknown
    );

    let sender = p.client.sender();
    assert_eq!(sender.send_due().unwrap(), 1, "CreateSequence");
    assert_eq!(sender.send_due().unwrap(), 1, "released application message");

    let report = p.client.sequence_status(&internal).await.unwrap();
    assert_eq!(report.status, SequenceStatus::Established);
    assert_eq!(report.acknowledged.numbers(), vec![1]);
    let sequence_id = report.sequence_id.clone().unwrap();
    assert_eq!(
        p.client.sequence_id_of(&internal).await.unwrap(),
        Some(sequence_id.clone())
    );
    // Lookup by the negotiated id works too.
    assert_eq!(
        p.client.sequence_status(&sequence_id).await.unwrap().internal_sequence_id,
        Some(internal.clone())
    );

    assert_eq!(p.server.invoker().deliver_pending().unwrap(), 1);
    let delivered = p.server_inbox.deliveries();
    assert_eq!(delivered[0].envelope.payload, b"hello".to_vec());

    let incoming = p.server.incoming_sequence_report(&sequence_id).await.unwrap();
    assert_eq!(incoming.next_to_deliver, 2);
    assert_eq!(incoming.pending_deliveries, 0);

    let done = p
        .client
        .wait_until_completed(&internal, Duration::from_millis(10))
        .await
        .unwrap();
    assert!(done.is_fully_acknowledged());
}

#[tokio::test]
async fn test_terminate_after_acknowledgement() {
    let p = pair();
    let internal = p
        .client
        .create_sequence(CreateSequenceRequest::new(EndpointReference::new(SERVER)))
        .await
        .unwrap();
    p.client
        .send(&internal, b"only".to_vec(), SendOptions::default())
        .await
        .unwrap();
    let sender = p.client.sender();
    sender.send_due().unwrap();
    sender.send_due().unwrap();

    p.client.terminate_sequence(&internal).await.unwrap();
    assert_eq!(sender.send_due().unwrap(), 1, "TerminateSequence");

    let report = p.client.sequence_status(&internal).await.unwrap();
    assert_eq!(report.status, SequenceStatus::Terminated);
    assert!(matches!(
        p.client
            .send(&internal, b"late".to_vec(), SendOptions::default())
            .await,
        Err(RmError::SequenceTerminated { .. })
    ));
}

#[tokio::test]
async fn test_wait_until_completed_times_out() {
    let engine = standalone();
    let internal = engine
        .create_sequence(CreateSequenceRequest::new(EndpointReference::new(SERVER)))
        .await
        .unwrap();
    let result = engine
        .wait_until_completed(&internal, Duration::from_millis(30))
        .await;
    assert!(matches!(result, Err(RmError::WaitTimeout { .. })));
}

#[tokio::test]
async fn test_close_is_unsupported_on_1_0() {
    let engine = standalone();
    let mut request = CreateSequenceRequest::new(EndpointReference::new(SERVER));
    request.rm_version = RmVersion::V1_0;
    let internal = engine.create_sequence(request).await.unwrap();
    assert!(matches!(
        engine.close_sequence(&internal).await,
        Err(RmError::UnsupportedOperation { .. })
    ));
}

#[tokio::test]
async fn test_receive_and_force_dispatch() {
    let inbox = Arc::new(RecordingDeliverer::new());
    let engine = RmEngine::with_time_source(
        RmConfig::for_testing(),
        Arc::new(ScriptedTransport::new()),
        inbox.clone(),
        Arc::new(MockTimeSource::new(0)),
    )
    .unwrap();

    let mut create = RmEnvelope::new();
    create.headers.create_sequence = Some(CreateSequence {
        acks_to: EndpointReference::anonymous(),
        offer: None,
        offer_endpoint: None,
    });
    let response = engine.process_inbound(create).await.unwrap().unwrap();
    let sequence_id = response
        .headers
        .create_sequence_response
        .unwrap()
        .identifier;

    for number in [2, 4] {
        let ack = engine
            .receive_application_message(&sequence_id, number, RmEnvelope::new())
            .await
            .unwrap();
        assert!(ack.is_some(), "anonymous acks-to answers on the back-channel");
    }
    assert_eq!(engine.invoker().deliver_pending().unwrap(), 0, "1 is missing");

    assert_eq!(engine.force_dispatch(&sequence_id, true).await.unwrap(), 2);
    assert_eq!(inbox.numbers_for(&sequence_id), vec![2, 4]);

    let report = engine.incoming_sequence_report(&sequence_id).await.unwrap();
    assert_eq!(report.received.numbers(), vec![2, 4]);
    assert_eq!(report.next_to_deliver, 5);
    assert_eq!(
        engine.outbound_for_inbound(&sequence_id).await.unwrap(),
        None
    );
}

#[test]
fn test_start_and_stop_workers() {
    let engine = standalone();
    assert!(!engine.is_running());
    engine.start().unwrap();
    engine.start().unwrap();
    assert!(engine.is_running());
    engine.stop().unwrap();
    assert!(!engine.is_running());
    engine.stop().unwrap();
}
