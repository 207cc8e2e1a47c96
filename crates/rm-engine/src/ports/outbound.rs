//! Driven Ports (SPI - Outbound Dependencies)
//!
//! The engine is driven by worker threads and transport threads, so these
//! ports are synchronous: a blocking call on a worker thread is the expected
//! cost of a transmission or a delivery.

use crate::domain::{RmEnvelope, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Transmission failure reported by a transport binding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Destination unreachable: {address}")]
    Unreachable { address: String },

    #[error("Message rejected by peer: {reason}")]
    Rejected { reason: String },

    #[error("Transport I/O failure: {message}")]
    Io { message: String },
}

/// Outbound transport binding (HTTP, JMS, file drop...).
pub trait Transport: Send + Sync {
    /// Transmit `envelope` to `envelope.to`.
    ///
    /// A returned envelope is the synchronous back-channel response; the
    /// engine processes it as an inbound message.
    fn send(&self, envelope: &RmEnvelope) -> Result<Option<RmEnvelope>, TransportError>;
}

/// Application message handed to the mediation engine in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub sequence_id: String,
    pub message_number: u64,
    pub envelope: RmEnvelope,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Delivery failed: {reason}")]
pub struct DeliveryError {
    pub reason: String,
}

impl DeliveryError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Callback into the mediation engine.
pub trait MessageDeliverer: Send + Sync {
    fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError>;
}

/// Time source abstraction for testability.
pub trait TimeSource: Send + Sync {
    /// Returns the current timestamp in milliseconds.
    fn now(&self) -> Timestamp;
}

/// Default system time source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }
}

/// Manually advanced clock for deterministic worker tests.
#[derive(Debug, Default)]
pub struct MockTimeSource {
    time: AtomicU64,
}

impl MockTimeSource {
    pub fn new(initial: Timestamp) -> Self {
        Self {
            time: AtomicU64::new(initial),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.time.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, time: Timestamp) {
        self.time.store(time, Ordering::SeqCst);
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> Timestamp {
        self.time.load(Ordering::SeqCst)
    }
}
