//! Error types for the reliable messaging engine

use crate::config::ConfigError;
use crate::domain::{BeanKey, BeanKind, RangeParseError, SequenceFault, TransitionError};
use thiserror::Error;

/// Transaction identifier.
pub type TransactionId = u64;

/// Engine errors
#[derive(Debug, Error)]
pub enum RmError {
    /// Bean-store call made outside a live transaction
    #[error("No active transaction")]
    NoActiveTransaction,

    /// Thread already owns a live transaction
    #[error("Transaction {existing} is already active on this thread")]
    TransactionAlreadyActive { existing: TransactionId },

    /// Circular wait detected while enlisting; the transaction was rolled back
    #[error("Deadlock: transaction {transaction} waiting for {holder} holding {bean}")]
    Deadlock {
        transaction: TransactionId,
        holder: TransactionId,
        bean: BeanKey,
    },

    #[error("Bean not found: {kind:?} {key}")]
    BeanNotFound { kind: BeanKind, key: String },

    #[error("Bean already exists: {kind:?} {key}")]
    DuplicateBean { kind: BeanKind, key: String },

    /// `find_unique` matched more than one record
    #[error("Expected at most one {kind:?} bean, found {count}")]
    NonUniqueResult { kind: BeanKind, count: usize },

    #[error("Stored message not found: {key}")]
    MessageNotFound { key: String },

    #[error("Unknown sequence: {id}")]
    SequenceNotFound { id: String },

    /// Operation needs a negotiated sequence id
    #[error("Sequence {internal_sequence_id} is not established yet")]
    SequenceNotEstablished { internal_sequence_id: String },

    #[error("Sequence {id} is closed")]
    SequenceClosed { id: String },

    #[error("Sequence {id} is terminated")]
    SequenceTerminated { id: String },

    #[error("Sequence {id} timed out")]
    SequenceTimedOut { id: String },

    #[error("Operation {operation} is not supported by {version}")]
    UnsupportedOperation { operation: String, version: String },

    /// Protocol fault (also sent to the peer)
    #[error("Protocol fault: {0}")]
    Protocol(SequenceFault),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error(transparent)]
    InvalidRange(#[from] RangeParseError),

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    /// Background worker failed or was joined abnormally
    #[error("Worker {name} failed: {reason}")]
    Worker { name: String, reason: String },

    #[error("Timed out waiting for {what}")]
    WaitTimeout { what: String },
}

impl From<SequenceFault> for RmError {
    fn from(fault: SequenceFault) -> Self {
        RmError::Protocol(fault)
    }
}

impl From<ConfigError> for RmError {
    fn from(err: ConfigError) -> Self {
        RmError::Config {
            reason: err.to_string(),
        }
    }
}

impl RmError {
    /// Deadlocks are retryable by the caller.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, RmError::Deadlock { .. })
    }

    pub fn fault(&self) -> Option<&SequenceFault> {
        match self {
            RmError::Protocol(fault) => Some(fault),
            _ => None,
        }
    }
}

/// Result type for engine operations
pub type RmResult<T> = Result<T, RmError>;
