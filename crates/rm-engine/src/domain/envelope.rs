//! Structured message envelope
//!
//! The engine never touches wire bytes. Transports and the mediation layer
//! hand it an [`RmEnvelope`] with the WS-Addressing properties and the WS-RM
//! control elements already parsed into [`RmHeaders`].

use crate::domain::fault::SequenceFault;
use crate::domain::range_string::MessageRange;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// WS-Addressing anonymous URI.
pub const ANONYMOUS_URI: &str = "http://www.w3.org/2005/08/addressing/anonymous";

/// WS-MakeConnection anonymous URI template prefix (`...?id=<uuid>`).
pub const MAKE_CONNECTION_ANONYMOUS_PREFIX: &str =
    "http://docs.oasis-open.org/ws-rx/wsmc/200702/anonymous?id=";

/// Highest message number a sequence may carry before rollover.
pub const MAX_MESSAGE_NUMBER: u64 = i64::MAX as u64;

/// WS-RM specification level a sequence was negotiated with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RmVersion {
    /// WS-RM 1.0 (February 2005): LastMessage marker, no CloseSequence.
    V1_0,
    /// WS-RM 1.1 (OASIS): CloseSequence and TerminateSequenceResponse.
    #[default]
    V1_1,
}

impl RmVersion {
    pub fn supports_close(&self) -> bool {
        matches!(self, RmVersion::V1_1)
    }

    pub fn has_terminate_response(&self) -> bool {
        matches!(self, RmVersion::V1_1)
    }

    pub fn namespace(&self) -> &'static str {
        match self {
            RmVersion::V1_0 => "http://schemas.xmlsoap.org/ws/2005/02/rm",
            RmVersion::V1_1 => "http://docs.oasis-open.org/ws-rx/wsrm/200702",
        }
    }
}

/// WS-Addressing endpoint reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointReference {
    pub address: String,
}

impl EndpointReference {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS_URI)
    }

    /// Fresh WS-MC anonymous address identifying one polling client.
    pub fn make_connection_anonymous() -> Self {
        Self::new(format!("{}{}", MAKE_CONNECTION_ANONYMOUS_PREFIX, Uuid::new_v4()))
    }

    /// True for both the WS-A and the WS-MC anonymous forms.
    pub fn is_anonymous(&self) -> bool {
        self.address == ANONYMOUS_URI || self.address.starts_with(MAKE_CONNECTION_ANONYMOUS_PREFIX)
    }

    /// True only for the WS-MC form, which a peer can poll for.
    pub fn is_make_connection_anonymous(&self) -> bool {
        self.address.starts_with(MAKE_CONNECTION_ANONYMOUS_PREFIX)
    }
}

/// True when no address is given or the address is anonymous.
pub fn is_back_channel(epr: Option<&EndpointReference>) -> bool {
    epr.map_or(true, EndpointReference::is_anonymous)
}

/// [`is_back_channel`] for a bare address.
pub fn is_back_channel_address(address: Option<&str>) -> bool {
    address.map_or(true, |address| {
        address == ANONYMOUS_URI || address.starts_with(MAKE_CONNECTION_ANONYMOUS_PREFIX)
    })
}

/// Kind of wire message a pending-send record carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Application,
    CreateSequence,
    CreateSequenceResponse,
    TerminateSequence,
    TerminateSequenceResponse,
    CloseSequence,
    CloseSequenceResponse,
    Acknowledgement,
    AckRequest,
    MakeConnection,
    Fault,
}

impl MessageType {
    /// Parses the names used in configuration (`"Application"`, `"Ack"`...).
    pub fn from_config_name(name: &str) -> Option<Self> {
        let kind = match name.trim() {
            "Application" => MessageType::Application,
            "CreateSequence" => MessageType::CreateSequence,
            "CreateSequenceResponse" => MessageType::CreateSequenceResponse,
            "TerminateSequence" => MessageType::TerminateSequence,
            "TerminateSequenceResponse" => MessageType::TerminateSequenceResponse,
            "CloseSequence" => MessageType::CloseSequence,
            "CloseSequenceResponse" => MessageType::CloseSequenceResponse,
            "Ack" | "Acknowledgement" => MessageType::Acknowledgement,
            "AckRequest" | "AckRequested" => MessageType::AckRequest,
            "MakeConnection" => MessageType::MakeConnection,
            "Fault" => MessageType::Fault,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSequence {
    pub acks_to: EndpointReference,
    /// Sequence id offered for the reverse direction.
    pub offer: Option<String>,
    /// Endpoint the offered sequence will be consumed at.
    pub offer_endpoint: Option<EndpointReference>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSequenceResponse {
    pub identifier: String,
    /// Set when the responder accepted an offer; the acks-to for the reverse sequence.
    pub accept: Option<EndpointReference>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceHeader {
    pub identifier: String,
    pub message_number: u64,
    /// WS-RM 1.0 LastMessage marker.
    pub last_message: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceAcknowledgement {
    pub identifier: String,
    pub ranges: Vec<MessageRange>,
    pub nacks: Vec<u64>,
    /// WS-RM 1.1 Final: the receiver accepts no further messages.
    pub is_final: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRequested {
    pub identifier: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateSequence {
    pub identifier: String,
    pub last_message_number: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateSequenceResponse {
    pub identifier: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSequence {
    pub identifier: String,
    pub last_message_number: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSequenceResponse {
    pub identifier: String,
}

/// WS-MC poll. Either selector may be present.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeConnection {
    pub address: Option<String>,
    pub identifier: Option<String>,
}

/// WS-RM control elements carried by one message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmHeaders {
    pub rm_version: RmVersion,
    pub create_sequence: Option<CreateSequence>,
    pub create_sequence_response: Option<CreateSequenceResponse>,
    pub sequence: Option<SequenceHeader>,
    pub acknowledgements: Vec<SequenceAcknowledgement>,
    pub ack_requested: Vec<AckRequested>,
    pub terminate_sequence: Option<TerminateSequence>,
    pub terminate_sequence_response: Option<TerminateSequenceResponse>,
    pub close_sequence: Option<CloseSequence>,
    pub close_sequence_response: Option<CloseSequenceResponse>,
    pub make_connection: Option<MakeConnection>,
    pub sequence_fault: Option<SequenceFault>,
}

impl RmHeaders {
    /// True when no RM element is present.
    pub fn is_empty(&self) -> bool {
        self.create_sequence.is_none()
            && self.create_sequence_response.is_none()
            && self.sequence.is_none()
            && self.acknowledgements.is_empty()
            && self.ack_requested.is_empty()
            && self.terminate_sequence.is_none()
            && self.terminate_sequence_response.is_none()
            && self.close_sequence.is_none()
            && self.close_sequence_response.is_none()
            && self.make_connection.is_none()
            && self.sequence_fault.is_none()
    }
}

/// Message as exchanged with transports and the mediation engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmEnvelope {
    pub message_id: String,
    pub relates_to: Option<String>,
    pub action: Option<String>,
    pub from: Option<EndpointReference>,
    pub to: Option<EndpointReference>,
    pub reply_to: Option<EndpointReference>,
    pub fault_to: Option<EndpointReference>,
    pub headers: RmHeaders,
    pub payload: Vec<u8>,
}

impl RmEnvelope {
    /// Envelope with a fresh `urn:uuid:` message id and nothing else set.
    pub fn new() -> Self {
        Self {
            message_id: new_message_id(),
            relates_to: None,
            action: None,
            from: None,
            to: None,
            reply_to: None,
            fault_to: None,
            headers: RmHeaders::default(),
            payload: Vec::new(),
        }
    }

    /// Application message addressed to `to`.
    pub fn application(to: Option<EndpointReference>, payload: Vec<u8>) -> Self {
        Self {
            to,
            payload,
            ..Self::new()
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: EndpointReference) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_relates_to(mut self, relates_to: impl Into<String>) -> Self {
        self.relates_to = Some(relates_to.into());
        self
    }

    /// Reply skeleton: addressed to `reply_to` of `self`, relating to its id.
    pub fn reply(&self) -> Self {
        Self {
            relates_to: Some(self.message_id.clone()),
            to: self.reply_to.clone(),
            headers: RmHeaders {
                rm_version: self.headers.rm_version,
                ..RmHeaders::default()
            },
            ..Self::new()
        }
    }
}

impl Default for RmEnvelope {
    fn default() -> Self {
        Self::new()
    }
}

pub fn new_message_id() -> String {
    format!("urn:uuid:{}", Uuid::new_v4())
}
