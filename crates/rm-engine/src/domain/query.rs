//! Query-by-example predicates
//!
//! Each bean kind has a predicate struct whose fields are `Option<T>`:
//! `None` is a wildcard, `Some(v)` requires the stored field to equal `v`.
//! Optional stored fields (`Option<T>` on the bean) only match when present
//! and equal.
//!
//! ```rust,ignore
//! // "any pending-send for this sequence that is enabled"
//! let query = SenderQuery {
//!     sequence_id: Some("urn:uuid:seq".into()),
//!     send: Some(true),
//!     ..Default::default()
//! };
//! ```

use crate::domain::beans::{InvokerBean, RmdBean, RmsBean, SenderBean};
use crate::domain::envelope::MessageType;
use crate::domain::lifecycle::SequenceState;

/// Predicate over stored beans of type `B`.
pub trait BeanQuery<B>: std::fmt::Debug {
    fn matches(&self, bean: &B) -> bool;
}

fn eq<T: PartialEq>(want: &Option<T>, have: &T) -> bool {
    want.as_ref().map_or(true, |w| w == have)
}

fn eq_opt<T: PartialEq>(want: &Option<T>, have: &Option<T>) -> bool {
    want.as_ref().map_or(true, |w| have.as_ref() == Some(w))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RmsQuery {
    pub internal_sequence_id: Option<String>,
    pub sequence_id: Option<String>,
    pub create_seq_msg_id: Option<String>,
    pub offered_sequence: Option<String>,
    pub state: Option<SequenceState>,
    pub closed: Option<bool>,
    pub terminated: Option<bool>,
    pub timed_out: Option<bool>,
    pub polling_mode: Option<bool>,
}

impl RmsQuery {
    pub fn by_sequence_id(sequence_id: impl Into<String>) -> Self {
        Self {
            sequence_id: Some(sequence_id.into()),
            ..Default::default()
        }
    }

    pub fn by_create_seq_msg_id(message_id: impl Into<String>) -> Self {
        Self {
            create_seq_msg_id: Some(message_id.into()),
            ..Default::default()
        }
    }
}

impl BeanQuery<RmsBean> for RmsQuery {
    fn matches(&self, bean: &RmsBean) -> bool {
        eq(&self.internal_sequence_id, &bean.internal_sequence_id)
            && eq_opt(&self.sequence_id, &bean.sequence_id)
            && eq(&self.create_seq_msg_id, &bean.create_seq_msg_id)
            && eq_opt(&self.offered_sequence, &bean.offered_sequence)
            && eq(&self.state, &bean.state)
            && eq(&self.closed, &bean.closed)
            && eq(&self.terminated, &bean.terminated)
            && eq(&self.timed_out, &bean.timed_out)
            && eq(&self.polling_mode, &bean.polling_mode)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RmdQuery {
    pub sequence_id: Option<String>,
    pub state: Option<SequenceState>,
    pub closed: Option<bool>,
    pub terminated: Option<bool>,
    pub polling_mode: Option<bool>,
    pub outbound_internal_sequence: Option<String>,
}

impl BeanQuery<RmdBean> for RmdQuery {
    fn matches(&self, bean: &RmdBean) -> bool {
        eq(&self.sequence_id, &bean.sequence_id)
            && eq(&self.state, &bean.state)
            && eq(&self.closed, &bean.closed)
            && eq(&self.terminated, &bean.terminated)
            && eq(&self.polling_mode, &bean.polling_mode)
            && eq_opt(&self.outbound_internal_sequence, &bean.outbound_internal_sequence)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SenderQuery {
    pub message_id: Option<String>,
    pub internal_sequence_id: Option<String>,
    pub sequence_id: Option<String>,
    pub to_address: Option<String>,
    pub message_type: Option<MessageType>,
    pub message_number: Option<u64>,
    pub send: Option<bool>,
    pub resend: Option<bool>,
    pub transport_available: Option<bool>,
}

impl SenderQuery {
    pub fn for_internal_sequence(internal_sequence_id: impl Into<String>) -> Self {
        Self {
            internal_sequence_id: Some(internal_sequence_id.into()),
            ..Default::default()
        }
    }
}

impl BeanQuery<SenderBean> for SenderQuery {
    fn matches(&self, bean: &SenderBean) -> bool {
        eq(&self.message_id, &bean.message_id)
            && eq_opt(&self.internal_sequence_id, &bean.internal_sequence_id)
            && eq_opt(&self.sequence_id, &bean.sequence_id)
            && eq_opt(&self.to_address, &bean.to_address)
            && eq(&self.message_type, &bean.message_type)
            && eq(&self.message_number, &bean.message_number)
            && eq(&self.send, &bean.send)
            && eq(&self.resend, &bean.resend)
            && eq(&self.transport_available, &bean.transport_available)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvokerQuery {
    pub sequence_id: Option<String>,
    pub message_number: Option<u64>,
}

impl InvokerQuery {
    pub fn for_sequence(sequence_id: impl Into<String>) -> Self {
        Self {
            sequence_id: Some(sequence_id.into()),
            message_number: None,
        }
    }
}

impl BeanQuery<InvokerBean> for InvokerQuery {
    fn matches(&self, bean: &InvokerBean) -> bool {
        eq(&self.sequence_id, &bean.sequence_id) && eq(&self.message_number, &bean.message_number)
    }
}
