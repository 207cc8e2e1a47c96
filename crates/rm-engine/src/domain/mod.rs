//! Domain module for the reliable messaging engine
//!
//! ## Core Modules
//! - range_string: run-length sets of message numbers
//! - beans: RMS / RMD / pending-send / pending-invoke records
//! - query: query-by-example predicates over the beans
//! - lifecycle: sequence state machine
//! - envelope: structured message and WS-RM control elements
//! - fault: WS-RM protocol faults

pub mod beans;
pub mod envelope;
pub mod fault;
pub mod lifecycle;
pub mod query;
pub mod range_string;

pub use beans::{
    Bean, BeanKey, BeanKind, InvokerBean, RmdBean, RmsBean, SenderBean, Timestamp, HELD_BACK,
};
pub use envelope::{
    is_back_channel, is_back_channel_address, new_message_id, AckRequested, CloseSequence,
    CloseSequenceResponse, CreateSequence, CreateSequenceResponse, EndpointReference,
    MakeConnection, MessageType, RmEnvelope, RmHeaders, RmVersion, SequenceAcknowledgement,
    SequenceHeader, TerminateSequence, TerminateSequenceResponse, MAX_MESSAGE_NUMBER,
};
pub use fault::{FaultKind, SequenceFault};
pub use lifecycle::{SequenceEvent, SequenceState, Side, TransitionError};
pub use query::{BeanQuery, InvokerQuery, RmdQuery, RmsQuery, SenderQuery};
pub use range_string::{MessageRange, RangeParseError, RangeString};
