//! Bean records shared by the processors and the workers
//!
//! | Bean | Key | Lifetime |
//! |------|-----|----------|
//! | [`RmsBean`] | internal sequence id | CreateSequence sent → removal timeout |
//! | [`RmdBean`] | sequence id | CreateSequence received → removal timeout |
//! | [`SenderBean`] | message id | queued → acknowledged / given up |
//! | [`InvokerBean`] | stored-message key | received → delivered |

use crate::domain::envelope::{EndpointReference, MessageType, RmVersion};
use crate::domain::lifecycle::{next_state, SequenceEvent, SequenceState, Side, TransitionError};
use crate::domain::range_string::RangeString;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// `time_to_send` value of a record deliberately held back.
pub const HELD_BACK: i64 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BeanKind {
    Rms,
    Rmd,
    Sender,
    Invoker,
}

/// Lockable identity of a stored record.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BeanKey {
    pub kind: BeanKind,
    pub key: String,
}

impl BeanKey {
    pub fn new(kind: BeanKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }
}

impl std::fmt::Display for BeanKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.key)
    }
}

/// A storable record with a string primary key.
pub trait Bean: Clone + std::fmt::Debug + Send + Sync + 'static {
    const KIND: BeanKind;

    fn key(&self) -> &str;

    fn bean_key(&self) -> BeanKey {
        BeanKey::new(Self::KIND, self.key())
    }
}

/// Sending-side sequence state.
///
/// INVARIANT: `highest_out_message_number < next_message_number`
/// INVARIANT: `client_completed_messages ⊆ [1, highest_out_message_number]`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmsBean {
    pub internal_sequence_id: String,
    /// Negotiated id, known once the CreateSequenceResponse arrives.
    pub sequence_id: Option<String>,
    pub create_seq_msg_id: String,
    pub rm_version: RmVersion,
    pub state: SequenceState,
    pub to_epr: Option<EndpointReference>,
    pub reply_to_epr: Option<EndpointReference>,
    pub acks_to_epr: Option<EndpointReference>,
    pub next_message_number: u64,
    pub highest_out_message_number: u64,
    pub client_completed_messages: RangeString,
    pub closed: bool,
    pub terminated: bool,
    pub timed_out: bool,
    /// Host asked for termination; honoured once everything is acknowledged.
    pub terminate_requested: bool,
    /// TerminateSequence already queued.
    pub terminate_added: bool,
    pub avoid_auto_termination: bool,
    /// The host flagged its final application message.
    pub last_message_sent: bool,
    pub polling_mode: bool,
    /// Reverse sequence id offered in our CreateSequence.
    pub offered_sequence: Option<String>,
    pub expected_replies: u64,
    pub last_activated_time: Timestamp,
    pub last_send_error: Option<String>,
    pub last_send_error_timestamp: Option<Timestamp>,
}

impl RmsBean {
    pub fn new(
        internal_sequence_id: impl Into<String>,
        create_seq_msg_id: impl Into<String>,
        rm_version: RmVersion,
        now: Timestamp,
    ) -> Self {
        Self {
            internal_sequence_id: internal_sequence_id.into(),
            sequence_id: None,
            create_seq_msg_id: create_seq_msg_id.into(),
            rm_version,
            state: SequenceState::Creating,
            to_epr: None,
            reply_to_epr: None,
            acks_to_epr: None,
            next_message_number: 1,
            highest_out_message_number: 0,
            client_completed_messages: RangeString::new(),
            closed: false,
            terminated: false,
            timed_out: false,
            terminate_requested: false,
            terminate_added: false,
            avoid_auto_termination: false,
            last_message_sent: false,
            polling_mode: false,
            offered_sequence: None,
            expected_replies: 0,
            last_activated_time: now,
            last_send_error: None,
            last_send_error_timestamp: None,
        }
    }

    /// Take the next message number.
    pub fn assign_message_number(&mut self) -> u64 {
        let number = self.next_message_number;
        self.next_message_number += 1;
        self.highest_out_message_number = self.highest_out_message_number.max(number);
        number
    }

    /// Every number handed out so far has been acknowledged.
    pub fn all_sent_acknowledged(&self) -> bool {
        self.client_completed_messages
            .covers_prefix(self.highest_out_message_number)
    }

    /// Ready for a TerminateSequence to be queued.
    pub fn should_terminate(&self) -> bool {
        let wanted = self.terminate_requested
            || (self.last_message_sent && !self.avoid_auto_termination);
        wanted
            && !self.terminate_added
            && !self.state.is_terminal()
            && self.sequence_id.is_some()
            && self.all_sent_acknowledged()
    }

    /// Apply a lifecycle event, keeping the boolean flags in step.
    pub fn apply(&mut self, event: SequenceEvent) -> Result<SequenceState, TransitionError> {
        self.state = next_state(Side::Sending, self.state, event)?;
        match event {
            SequenceEvent::Close => self.closed = true,
            SequenceEvent::TerminateQueued => self.terminate_added = true,
            SequenceEvent::Terminate => self.terminated = true,
            SequenceEvent::TimeOut => self.timed_out = true,
            SequenceEvent::Establish => {}
        }
        Ok(self.state)
    }

    pub fn record_send_error(&mut self, error: impl Into<String>, now: Timestamp) {
        self.last_send_error = Some(error.into());
        self.last_send_error_timestamp = Some(now);
    }
}

impl Bean for RmsBean {
    const KIND: BeanKind = BeanKind::Rms;

    fn key(&self) -> &str {
        &self.internal_sequence_id
    }
}

/// Receiving-side sequence state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmdBean {
    pub sequence_id: String,
    pub rm_version: RmVersion,
    pub state: SequenceState,
    pub acks_to_epr: Option<EndpointReference>,
    pub reply_to_epr: Option<EndpointReference>,
    /// Next number the invoker may hand to the application.
    pub next_msg_no_to_process: u64,
    pub highest_in_message_number: u64,
    pub highest_in_message_id: Option<String>,
    pub last_in_message_id: Option<String>,
    pub server_completed_messages: RangeString,
    /// Numbers allowed to bypass strict ordering.
    pub out_of_order_ranges: Option<RangeString>,
    /// Number carried by the peer's LastMessage / Close / Terminate.
    pub last_message_number: Option<u64>,
    pub closed: bool,
    pub terminated: bool,
    pub polling_mode: bool,
    /// Internal id of the reverse sequence this one was offered for.
    pub outbound_internal_sequence: Option<String>,
    pub last_activated_time: Timestamp,
}

impl RmdBean {
    pub fn new(sequence_id: impl Into<String>, rm_version: RmVersion, now: Timestamp) -> Self {
        Self {
            sequence_id: sequence_id.into(),
            rm_version,
            state: SequenceState::Creating,
            acks_to_epr: None,
            reply_to_epr: None,
            next_msg_no_to_process: 1,
            highest_in_message_number: 0,
            highest_in_message_id: None,
            last_in_message_id: None,
            server_completed_messages: RangeString::new(),
            out_of_order_ranges: None,
            last_message_number: None,
            closed: false,
            terminated: false,
            polling_mode: false,
            outbound_internal_sequence: None,
            last_activated_time: now,
        }
    }

    pub fn apply(&mut self, event: SequenceEvent) -> Result<SequenceState, TransitionError> {
        self.state = next_state(Side::Receiving, self.state, event)?;
        match event {
            SequenceEvent::Close => self.closed = true,
            SequenceEvent::Terminate => self.terminated = true,
            _ => {}
        }
        Ok(self.state)
    }

    /// `number` may be delivered ahead of `next_msg_no_to_process`.
    pub fn is_out_of_order_allowed(&self, number: u64) -> bool {
        self.out_of_order_ranges
            .as_ref()
            .is_some_and(|ranges| ranges.contains(number))
    }

    /// Every message up to the last announced number has been received.
    pub fn is_complete(&self) -> bool {
        match self.last_message_number {
            Some(last) => self.server_completed_messages.covers_prefix(last),
            None => false,
        }
    }
}

impl Bean for RmdBean {
    const KIND: BeanKind = BeanKind::Rmd;

    fn key(&self) -> &str {
        &self.sequence_id
    }
}

/// Outbound wire message awaiting (re)transmission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderBean {
    pub message_id: String,
    pub message_store_key: String,
    /// Owning RMS, when the message belongs to a sending sequence.
    pub internal_sequence_id: Option<String>,
    pub sequence_id: Option<String>,
    pub to_address: Option<String>,
    pub message_type: MessageType,
    /// 0 for control messages.
    pub message_number: u64,
    pub send: bool,
    pub resend: bool,
    pub sent_count: u32,
    /// Due time in ms; [`HELD_BACK`] keeps the record parked.
    pub time_to_send: i64,
    /// False while waiting for the peer to poll with MakeConnection.
    pub transport_available: bool,
    pub last_message: bool,
}

impl SenderBean {
    pub fn new(
        message_id: impl Into<String>,
        message_store_key: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            message_store_key: message_store_key.into(),
            internal_sequence_id: None,
            sequence_id: None,
            to_address: None,
            message_type,
            message_number: 0,
            send: true,
            resend: false,
            sent_count: 0,
            time_to_send: 0,
            transport_available: true,
            last_message: false,
        }
    }

    /// Due at `now` and allowed to go out.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.send
            && self.transport_available
            && self.time_to_send >= 0
            && self.time_to_send as u64 <= now
            && (self.resend || self.sent_count == 0)
    }
}

impl Bean for SenderBean {
    const KIND: BeanKind = BeanKind::Sender;

    fn key(&self) -> &str {
        &self.message_id
    }
}

/// Received application message awaiting in-order delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokerBean {
    pub message_store_key: String,
    pub sequence_id: String,
    pub message_number: u64,
}

impl Bean for InvokerBean {
    const KIND: BeanKind = BeanKind::Invoker;

    fn key(&self) -> &str {
        &self.message_store_key
    }
}
