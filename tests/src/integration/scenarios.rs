//! # End-to-End Scenarios
//!
//! ```text
//! client engine ──CreateSequence / Sequence / Close / Terminate──→ server engine
//!       ↑                                                              │
//!       └──── back-channel: CSR, acknowledgements, responses ──────────┘
//! ```
//!
//! ## Test Categories
//!
//! 1. **Happy Path**: establish, send, acknowledge, deliver, terminate
//! 2. **Failure Handling**: unreachable peer, retransmission limit
//! 3. **Duplicates**: repeated inbound message numbers
//! 4. **Replies**: offered sequences, direct and over MakeConnection
//! 5. **Worker Threads**: the same exchange with real workers

#[cfg(test)]
mod tests {
    use super::super::harness::{Harness, CLIENT, MAX_ROUNDS, SERVER};
    use rm_engine::domain::{InvokerBean, InvokerQuery, RmsBean, SequenceHeader};
    use rm_engine::{
        CreateSequenceRequest, EndpointReference, RecordingDeliverer, ReliableMessagingApi,
        RmConfig, RmEngine, RmEnvelope, RmError, RmVersion, SendOptions, SequenceState,
        SequenceStatus,
    };
    use std::sync::Arc;
    use std::time::Duration;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    fn to_server() -> CreateSequenceRequest {
        CreateSequenceRequest::new(EndpointReference::new(SERVER))
    }

    async fn send(engine: &RmEngine, internal: &str, payload: &str) -> u64 {
        engine
            .send(internal, payload.as_bytes().to_vec(), SendOptions::default())
            .await
            .expect("send accepted")
    }

    async fn established(h: &Harness, request: CreateSequenceRequest) -> (String, String) {
        let internal = h.client.create_sequence(request).await.unwrap();
        assert!(h.settle().unwrap() < MAX_ROUNDS);
        let sequence_id = h
            .client
            .sequence_id_of(&internal)
            .await
            .unwrap()
            .expect("sequence established");
        (internal, sequence_id)
    }

    // =============================================================================
    // HAPPY PATH
    // =============================================================================

    /// Three messages, the third lost in transit: completed {1-2}, 3 still pending.
    #[tokio::test]
    async fn test_partial_acknowledgement_keeps_unacknowledged_message() {
        let h = Harness::new().unwrap();
        let (internal, sequence_id) = established(&h, to_server()).await;

        send(&h.client, &internal, "one").await;
        send(&h.client, &internal, "two").await;
        h.settle().unwrap();

        h.network.set_offline(SERVER, true);
        send(&h.client, &internal, "three").await;
        h.settle().unwrap();

        let report = h.client.sequence_status(&internal).await.unwrap();
        assert_eq!(report.acknowledged.to_string(), "1-2");
        assert_eq!(report.highest_sent, 3);
        assert_eq!(Harness::pending_application(&h.client), vec![3]);
        assert!(report.last_send_error.is_some());
        assert_eq!(h.server_inbox.numbers_for(&sequence_id), vec![1, 2]);

        h.network.set_offline(SERVER, false);
        h.advance(100);
        h.settle().unwrap();

        let report = h.client.sequence_status(&internal).await.unwrap();
        assert_eq!(report.acknowledged.to_string(), "1-3");
        assert!(Harness::pending_application(&h.client).is_empty());
        assert_eq!(h.server_inbox.numbers_for(&sequence_id), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_close_then_terminate() {
        let h = Harness::new().unwrap();
        let (internal, sequence_id) = established(&h, to_server()).await;
        send(&h.client, &internal, "one").await;
        send(&h.client, &internal, "two").await;
        h.settle().unwrap();

        h.client.close_sequence(&internal).await.unwrap();
        h.settle().unwrap();
        let report = h.client.sequence_status(&internal).await.unwrap();
        assert_eq!(report.state, Some(SequenceState::Closed));
        assert_eq!(report.status, SequenceStatus::Established);
        assert!(matches!(
            h.client
                .send(&internal, b"late".to_vec(), SendOptions::default())
                .await,
            Err(RmError::SequenceClosed { .. })
        ));
        let incoming = h.server.incoming_sequence_report(&sequence_id).await.unwrap();
        assert_eq!(incoming.state, SequenceState::Closed);

        h.client.terminate_sequence(&internal).await.unwrap();
        h.settle().unwrap();
        let report = h.client.sequence_status(&internal).await.unwrap();
        assert_eq!(report.status, SequenceStatus::Terminated);
        assert_eq!(report.acknowledged.to_string(), "1-2");
        let incoming = h.server.incoming_sequence_report(&sequence_id).await.unwrap();
        assert_eq!(incoming.state, SequenceState::Terminated);
    }

    #[tokio::test]
    async fn test_last_message_terminates_automatically() {
        let h = Harness::new().unwrap();
        let (internal, _) = established(&h, to_server()).await;
        send(&h.client, &internal, "one").await;
        h.client
            .send(
                &internal,
                b"two".to_vec(),
                SendOptions {
                    last_message: true,
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();
        h.settle().unwrap();

        let report = h
            .client
            .wait_until_completed(&internal, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(report.status, SequenceStatus::Terminated);
    }

    // =============================================================================
    // FAILURE HANDLING
    // =============================================================================

    /// Retransmission limit of 3: the fourth attempt times the sequence out.
    #[tokio::test]
    async fn test_retry_limit_times_out_sequence() {
        let h = Harness::new().unwrap();
        let (internal, sequence_id) = established(&h, to_server()).await;
        h.network.set_offline(SERVER, true);
        send(&h.client, &internal, "doomed").await;

        for _ in 0..3 {
            h.settle().unwrap();
            h.advance(100);
        }
        h.settle().unwrap();

        let report = h.client.sequence_status(&internal).await.unwrap();
        assert_eq!(report.status, SequenceStatus::TimedOut);
        assert!(report
            .last_send_error
            .as_deref()
            .is_some_and(|reason| reason.contains("maximum retransmission")));
        assert!(matches!(
            h.client
                .wait_until_completed(&internal, Duration::from_millis(10))
                .await,
            Err(RmError::SequenceTimedOut { .. })
        ));

        // Nothing is retried once timed out, even with the peer back.
        h.network.set_offline(SERVER, false);
        h.advance(1_000);
        h.settle().unwrap();
        assert!(h.server_inbox.numbers_for(&sequence_id).is_empty());
        assert!(matches!(
            h.client
                .send(&internal, b"more".to_vec(), SendOptions::default())
                .await,
            Err(RmError::SequenceTimedOut { .. })
        ));
    }

    #[tokio::test]
    async fn test_unestablished_sequence_times_out() {
        let h = Harness::new().unwrap();
        h.network.set_offline(SERVER, true);
        let internal = h.client.create_sequence(to_server()).await.unwrap();
        send(&h.client, &internal, "held").await;

        for _ in 0..4 {
            h.settle().unwrap();
            h.advance(100);
        }

        let report = h.client.sequence_status(&internal).await.unwrap();
        assert_eq!(report.status, SequenceStatus::TimedOut);
        assert!(report.sequence_id.is_none());
    }

    // =============================================================================
    // DUPLICATES
    // =============================================================================

    /// Number 5 arriving twice is acknowledged twice but queued once.
    #[tokio::test]
    async fn test_duplicate_inbound_message_is_queued_once() {
        let h = Harness::new().unwrap();
        let (_, sequence_id) = established(&h, to_server()).await;

        let mut message = RmEnvelope::application(
            Some(EndpointReference::new(SERVER)),
            b"five".to_vec(),
        );
        message.headers.sequence = Some(SequenceHeader {
            identifier: sequence_id.clone(),
            message_number: 5,
            last_message: false,
        });

        let first = h.server.process_inbound(message.clone()).await.unwrap();
        assert!(first.is_some());
        let before = h.server.incoming_sequence_report(&sequence_id).await.unwrap();

        let second = h.server.process_inbound(message).await.unwrap();
        let ack = second.expect("duplicate is acknowledged again");
        assert_eq!(ack.headers.acknowledgements[0].identifier, sequence_id);

        let after = h.server.incoming_sequence_report(&sequence_id).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(after.received.to_string(), "5-5");
        let queued: Vec<InvokerBean> = h
            .server
            .context()
            .store
            .snapshot(&InvokerQuery::for_sequence(&sequence_id));
        assert_eq!(queued.len(), 1);

        // In-order delivery waits for 1..4.
        assert_eq!(h.server.invoker().deliver_pending().unwrap(), 0);
    }

    // =============================================================================
    // REPLIES
    // =============================================================================

    #[tokio::test]
    async fn test_offered_sequence_carries_replies() {
        let h = Harness::new().unwrap();
        let mut request = to_server();
        request.offer = true;
        request.reply_to = Some(EndpointReference::new(CLIENT));
        let (internal, sequence_id) = established(&h, request).await;

        h.client
            .send(
                &internal,
                b"ping".to_vec(),
                SendOptions {
                    expects_reply: true,
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();
        h.settle().unwrap();
        assert_eq!(h.server_inbox.numbers_for(&sequence_id), vec![1]);

        let reverse = h
            .server
            .outbound_for_inbound(&sequence_id)
            .await
            .unwrap()
            .expect("offer accepted");
        let offered = h.server.sequence_id_of(&reverse).await.unwrap().unwrap();
        send(&h.server, &reverse, "pong").await;
        h.settle().unwrap();

        let replies = h.client_inbox.deliveries();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].sequence_id, offered);
        assert_eq!(replies[0].envelope.payload, b"pong".to_vec());
        let rms: RmsBean = h.client.context().store.peek(&internal).unwrap();
        assert_eq!(rms.expected_replies, 0);

        // The client acknowledges the reply after its acknowledgement interval.
        h.advance(50);
        h.settle().unwrap();
        let report = h.server.sequence_status(&reverse).await.unwrap();
        assert_eq!(report.acknowledged.to_string(), "1-1");
    }

    /// The client is unreachable, so its replies wait for a MakeConnection.
    #[tokio::test]
    async fn test_polling_client_fetches_replies() {
        let h = Harness::new().unwrap();
        h.network.unregister(CLIENT);
        let mut request = to_server();
        request.offer = true;
        request.polling_mode = true;
        let (internal, sequence_id) = established(&h, request).await;

        h.client
            .send(
                &internal,
                b"ping".to_vec(),
                SendOptions {
                    expects_reply: true,
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();
        h.settle().unwrap();
        assert_eq!(h.server_inbox.numbers_for(&sequence_id), vec![1]);

        let reverse = h
            .server
            .outbound_for_inbound(&sequence_id)
            .await
            .unwrap()
            .unwrap();
        send(&h.server, &reverse, "pong").await;
        assert_eq!(h.server.sender().send_due().unwrap(), 0, "parked");
        assert!(h.client_inbox.is_empty());

        h.advance(100);
        h.settle().unwrap();
        let replies = h.client_inbox.deliveries();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].envelope.payload, b"pong".to_vec());
        let report = h.client.sequence_status(&internal).await.unwrap();
        assert!(report.is_fully_acknowledged());
    }

    #[tokio::test]
    async fn test_close_unsupported_on_1_0() {
        let h = Harness::new().unwrap();
        let mut request = to_server();
        request.rm_version = RmVersion::V1_0;
        let (internal, sequence_id) = established(&h, request).await;
        send(&h.client, &internal, "one").await;
        h.settle().unwrap();

        assert!(matches!(
            h.client.close_sequence(&internal).await,
            Err(RmError::UnsupportedOperation { .. })
        ));

        // 1.0 has no TerminateSequenceResponse; the sender finishes on send.
        h.client.terminate_sequence(&internal).await.unwrap();
        h.settle().unwrap();
        let report = h.client.sequence_status(&internal).await.unwrap();
        assert_eq!(report.status, SequenceStatus::Terminated);
        let incoming = h.server.incoming_sequence_report(&sequence_id).await.unwrap();
        assert_eq!(incoming.state, SequenceState::Terminated);
    }

    // =============================================================================
    // WORKER THREADS
    // =============================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_workers_complete_exchange() {
        let config = RmConfig {
            max_retransmission_count: None,
            sequence_removal_timeout: None,
            ..RmConfig::for_testing()
        };
        let network = rm_engine::LoopbackNetwork::new();
        let server_inbox = Arc::new(RecordingDeliverer::new());
        let client = RmEngine::new(
            config.clone(),
            Arc::new(network.transport()),
            Arc::new(RecordingDeliverer::new()),
        )
        .unwrap();
        let server = RmEngine::new(config, Arc::new(network.transport()), server_inbox.clone())
            .unwrap();
        network.register(SERVER, server.context());
        client.start().unwrap();
        server.start().unwrap();

        let internal = client.create_sequence(to_server()).await.unwrap();
        for payload in ["a", "b", "c"] {
            send(&client, &internal, payload).await;
        }
        let report = client
            .wait_until_completed(&internal, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(report.acknowledged.to_string(), "1-3");

        let sequence_id = report.sequence_id.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while server_inbox.len() < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server_inbox.numbers_for(&sequence_id), vec![1, 2, 3]);

        client.terminate_sequence(&internal).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = client.sequence_status(&internal).await.unwrap().status;
            if status == SequenceStatus::Terminated || tokio::time::Instant::now() >= deadline {
                assert_eq!(status, SequenceStatus::Terminated);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        client.stop().unwrap();
        server.stop().unwrap();
    }
}
