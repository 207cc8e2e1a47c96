//! WS-RM protocol faults
//!
//! Faults are sent to the peer as a `SequenceFault` element and returned to
//! local callers inside `RmError::Protocol`.
//!
//! | Kind | SOAP code | Sub-code |
//! |------|-----------|----------|
//! | UnknownSequence | Sender | wsrm:UnknownSequence |
//! | InvalidAcknowledgement | Sender | wsrm:InvalidAcknowledgement |
//! | CreateSequenceRefused | Sender | wsrm:CreateSequenceRefused |
//! | SequenceTerminated | Sender | wsrm:SequenceTerminated |
//! | SequenceClosed | Sender | wsrm:SequenceClosed |
//! | MessageNumberRollover | Sender | wsrm:MessageNumberRollover |
//! | LastMessageNumberExceeded | Sender | wsrm:LastMessageNumberExceeded |
//! | InvalidMessage | Sender | wsrm:InvalidMessage |

use crate::domain::envelope::{RmEnvelope, RmHeaders};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    UnknownSequence,
    InvalidAcknowledgement,
    CreateSequenceRefused,
    SequenceTerminated,
    SequenceClosed,
    MessageNumberRollover,
    LastMessageNumberExceeded,
    /// Version mismatch or a required element missing.
    InvalidMessage,
}

impl FaultKind {
    /// SOAP fault code. Every RM fault raised here blames the sender.
    pub fn code(&self) -> &'static str {
        "Sender"
    }

    pub fn subcode(&self) -> &'static str {
        match self {
            FaultKind::UnknownSequence => "wsrm:UnknownSequence",
            FaultKind::InvalidAcknowledgement => "wsrm:InvalidAcknowledgement",
            FaultKind::CreateSequenceRefused => "wsrm:CreateSequenceRefused",
            FaultKind::SequenceTerminated => "wsrm:SequenceTerminated",
            FaultKind::SequenceClosed => "wsrm:SequenceClosed",
            FaultKind::MessageNumberRollover => "wsrm:MessageNumberRollover",
            FaultKind::LastMessageNumberExceeded => "wsrm:LastMessageNumberExceeded",
            FaultKind::InvalidMessage => "wsrm:InvalidMessage",
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            FaultKind::UnknownSequence => "The value of wsrm:Identifier is not a known Sequence identifier",
            FaultKind::InvalidAcknowledgement => {
                "The SequenceAcknowledgement violates the cumulative Acknowledgement invariant"
            }
            FaultKind::CreateSequenceRefused => "The Create Sequence request has been refused by the RM Destination",
            FaultKind::SequenceTerminated => "The Sequence has been terminated due to an unrecoverable error",
            FaultKind::SequenceClosed => "The Sequence is closed and cannot accept new messages",
            FaultKind::MessageNumberRollover => "The maximum value for wsrm:MessageNumber has been exceeded",
            FaultKind::LastMessageNumberExceeded => {
                "The value for wsrm:MessageNumber exceeds the value of the MessageNumber accompanying a LastMessage element in this Sequence"
            }
            FaultKind::InvalidMessage => "The message is not valid for the bound sequence",
        }
    }
}

/// Fault raised against a sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFault {
    pub kind: FaultKind,
    pub identifier: Option<String>,
    pub detail: String,
}

impl SequenceFault {
    pub fn new(kind: FaultKind, identifier: Option<&str>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.map(str::to_string),
            detail: detail.into(),
        }
    }

    pub fn unknown_sequence(identifier: &str) -> Self {
        Self::new(
            FaultKind::UnknownSequence,
            Some(identifier),
            format!("sequence {} is not known", identifier),
        )
    }

    /// Fault message addressed back along `request`'s fault-to / reply-to.
    pub fn to_envelope(&self, request: &RmEnvelope) -> RmEnvelope {
        let mut envelope = request.reply();
        if request.fault_to.is_some() {
            envelope.to = request.fault_to.clone();
        }
        envelope.headers = RmHeaders {
            rm_version: request.headers.rm_version,
            sequence_fault: Some(self.clone()),
            ..RmHeaders::default()
        };
        envelope
    }
}

impl fmt::Display for SequenceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind.subcode(), self.kind.reason(), self.detail)
    }
}
