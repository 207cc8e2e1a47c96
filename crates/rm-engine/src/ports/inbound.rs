//! Driving Ports (API - Inbound)
//!
//! The host-facing surface of the engine: sequence control, application
//! send/receive, inbound message processing and status queries.

use crate::domain::{
    EndpointReference, RangeString, RmEnvelope, RmVersion, SequenceState, Timestamp,
};
use crate::error::RmResult;
use async_trait::async_trait;
use std::time::Duration;

/// Parameters of an outbound sequence.
#[derive(Clone, Debug)]
pub struct CreateSequenceRequest {
    /// RM destination.
    pub to: EndpointReference,
    /// Where the peer sends acknowledgements (`None` = back-channel).
    pub acks_to: Option<EndpointReference>,
    /// Where replies to application messages go (`None` = back-channel).
    pub reply_to: Option<EndpointReference>,
    /// Host key; `to` + key identify the sequence. Random when absent.
    pub sequence_key: Option<String>,
    /// Offer a reverse sequence for replies.
    pub offer: bool,
    pub rm_version: RmVersion,
    /// This endpoint cannot accept connections; responses are polled for.
    pub polling_mode: bool,
    /// Do not terminate automatically after the last message.
    pub avoid_auto_termination: bool,
}

impl CreateSequenceRequest {
    pub fn new(to: EndpointReference) -> Self {
        Self {
            to,
            acks_to: None,
            reply_to: None,
            sequence_key: None,
            offer: false,
            rm_version: RmVersion::default(),
            polling_mode: false,
            avoid_auto_termination: false,
        }
    }
}

/// Per-message options for [`ReliableMessagingApi::send`].
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Final application message of the sequence.
    pub last_message: bool,
    /// A reply is expected on the offered sequence.
    pub expects_reply: bool,
    pub action: Option<String>,
}

/// Coarse status of an outbound sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// No record, or the sequence id is not negotiated yet.
    Unknown,
    Established,
    Terminated,
    TimedOut,
}

/// Outgoing sequence report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceReport {
    pub internal_sequence_id: Option<String>,
    pub sequence_id: Option<String>,
    pub status: SequenceStatus,
    pub state: Option<SequenceState>,
    /// Message numbers the peer has acknowledged.
    pub acknowledged: RangeString,
    pub highest_sent: u64,
    pub last_send_error: Option<String>,
    pub last_send_error_timestamp: Option<Timestamp>,
}

impl SequenceReport {
    pub fn unknown(internal_sequence_id: &str) -> Self {
        Self {
            internal_sequence_id: Some(internal_sequence_id.to_string()),
            sequence_id: None,
            status: SequenceStatus::Unknown,
            state: None,
            acknowledged: RangeString::new(),
            highest_sent: 0,
            last_send_error: None,
            last_send_error_timestamp: None,
        }
    }

    /// Every message sent so far is acknowledged.
    pub fn is_fully_acknowledged(&self) -> bool {
        self.acknowledged.covers_prefix(self.highest_sent)
    }
}

/// Incoming sequence report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingSequenceReport {
    pub sequence_id: String,
    pub state: SequenceState,
    pub received: RangeString,
    pub next_to_deliver: u64,
    pub highest_received: u64,
    pub pending_deliveries: usize,
}

/// Primary engine API
#[async_trait]
pub trait ReliableMessagingApi: Send + Sync {
    /// Start an outbound sequence; returns its internal sequence id.
    async fn create_sequence(&self, request: CreateSequenceRequest) -> RmResult<String>;

    /// Queue an application message; returns its message number.
    async fn send(
        &self,
        internal_sequence_id: &str,
        payload: Vec<u8>,
        options: SendOptions,
    ) -> RmResult<u64>;

    /// Terminate once every sent message is acknowledged.
    async fn terminate_sequence(&self, internal_sequence_id: &str) -> RmResult<()>;

    /// Close the sequence (WS-RM 1.1 only).
    async fn close_sequence(&self, internal_sequence_id: &str) -> RmResult<()>;

    /// Ask the peer for an immediate acknowledgement.
    async fn send_ack_request(&self, internal_sequence_id: &str) -> RmResult<()>;

    /// Status and acknowledged set, by internal or negotiated sequence id.
    async fn sequence_status(&self, id: &str) -> RmResult<SequenceReport>;

    /// Accept a validated application message for in-order delivery.
    ///
    /// Returns the acknowledgement to put on the back-channel, if any.
    async fn receive_application_message(
        &self,
        sequence_id: &str,
        message_number: u64,
        message: RmEnvelope,
    ) -> RmResult<Option<RmEnvelope>>;

    /// Process any inbound message carrying RM headers.
    async fn process_inbound(&self, envelope: RmEnvelope) -> RmResult<Option<RmEnvelope>>;

    async fn incoming_sequence_report(&self, sequence_id: &str) -> RmResult<IncomingSequenceReport>;

    async fn last_send_error(
        &self,
        internal_sequence_id: &str,
    ) -> RmResult<Option<(String, Timestamp)>>;

    /// Wait until everything sent is acknowledged or the sequence ends.
    async fn wait_until_completed(
        &self,
        internal_sequence_id: &str,
        max_wait: Duration,
    ) -> RmResult<SequenceReport>;

    /// Deliver every queued message of an inbound sequence now.
    async fn force_dispatch(&self, sequence_id: &str, allow_later_delivery: bool) -> RmResult<usize>;

    async fn sequence_id_of(&self, internal_sequence_id: &str) -> RmResult<Option<String>>;

    /// Internal id of the reverse (offered) sequence of an inbound sequence.
    async fn outbound_for_inbound(&self, inbound_sequence_id: &str) -> RmResult<Option<String>>;
}
