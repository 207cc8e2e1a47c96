//! Ports (Hexagonal Architecture)
//!
//! - `inbound`: API the host drives the engine through
//! - `outbound`: transport, delivery and clock dependencies

pub mod inbound;
pub mod outbound;

pub use inbound::{
    CreateSequenceRequest, IncomingSequenceReport, ReliableMessagingApi, SendOptions,
    SequenceReport, SequenceStatus,
};
pub use outbound::{
    Delivery, DeliveryError, MessageDeliverer, MockTimeSource, SystemTimeSource, TimeSource,
    Transport, TransportError,
};
