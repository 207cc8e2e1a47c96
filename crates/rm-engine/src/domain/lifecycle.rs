//! Sequence lifecycle state machine
//!
//! Sending side (RMS):
//! ```text
//! [CREATING] ──CSR──→ [ESTABLISHED] ──close──→ [CLOSED]
//!     │                    │                       │
//!     │                    └──terminate queued──→ [TERMINATING] ←──┘
//!     │                                               │
//!     └───────────────── terminated ─────────────────→ [TERMINATED]
//!
//!   any non-terminal state ──retries exhausted / inactivity──→ [TIMED_OUT]
//! ```
//!
//! Receiving side (RMD):
//! ```text
//! [CREATING] ──establish──→ [ESTABLISHED] ──close──→ [CLOSED]
//!                                │                      │
//!                                └──── terminated ──────┴──→ [TERMINATED]
//! ```
//!
//! Transitions are a pure function of `(side, state, event)`. Re-applying an
//! event that leads to the current state is accepted so duplicate control
//! messages stay harmless.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Sending,
    Receiving,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceState {
    #[default]
    Creating,
    Established,
    Closed,
    Terminating,
    Terminated,
    TimedOut,
}

impl SequenceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SequenceState::Terminated | SequenceState::TimedOut)
    }

    /// Application messages may still be numbered and sent.
    pub fn accepts_messages(&self) -> bool {
        matches!(self, SequenceState::Creating | SequenceState::Established)
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SequenceState::Creating => "CREATING",
            SequenceState::Established => "ESTABLISHED",
            SequenceState::Closed => "CLOSED",
            SequenceState::Terminating => "TERMINATING",
            SequenceState::Terminated => "TERMINATED",
            SequenceState::TimedOut => "TIMED_OUT",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SequenceEvent {
    /// Sequence id negotiated (CSR received, or CS accepted on the receiving side).
    Establish,
    Close,
    /// TerminateSequence queued for transmission.
    TerminateQueued,
    Terminate,
    TimeOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {side:?} sequence transition: {from} on {event:?}")]
pub struct TransitionError {
    pub side: Side,
    pub from: SequenceState,
    pub event: SequenceEvent,
}

/// Next state for `event`, or an error when the move is illegal.
pub fn next_state(
    side: Side,
    from: SequenceState,
    event: SequenceEvent,
) -> Result<SequenceState, TransitionError> {
    use SequenceEvent as E;
    use SequenceState as S;

    let next = match (side, from, event) {
        (_, S::Creating, E::Establish) => Some(S::Established),
        (_, S::Established, E::Establish) => Some(S::Established),

        (_, S::Established | S::Closed, E::Close) => Some(S::Closed),

        (Side::Sending, S::Established | S::Closed | S::Terminating, E::TerminateQueued) => {
            Some(S::Terminating)
        }

        (Side::Sending, s, E::Terminate) if s != S::TimedOut => Some(S::Terminated),
        (Side::Receiving, S::Creating | S::Established | S::Closed | S::Terminated, E::Terminate) => {
            Some(S::Terminated)
        }

        (Side::Sending, s, E::TimeOut) if s != S::Terminated => Some(S::TimedOut),

        _ => None,
    };

    next.ok_or(TransitionError { side, from, event })
}
