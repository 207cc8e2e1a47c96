//! # RM Engine
//!
//! WS-ReliableMessaging engine: sending and receiving sequences kept in a
//! transactional bean store and driven by background workers.
//!
//! ## Architecture
//!
//! This crate follows Hexagonal Architecture (Ports & Adapters):
//!
//! - **Domain Layer** (`domain/`): Pure protocol logic, no I/O
//!   - `RangeString`: Canonical set of message numbers
//!   - `RmsBean`, `RmdBean`, `SenderBean`, `InvokerBean`: Persistent records
//!   - `SequenceState`: Sequence lifecycle state machine
//!   - `RmEnvelope`: Protocol-neutral message with RM headers
//!
//! - **Store Layer** (`store/`): Bean store with query-by-example,
//!   per-bean locks, deadlock detection and a message store
//!
//! - **Processors Layer** (`processors/`): Inbound and outbound protocol
//!   handling (CreateSequence, Sequence, acknowledgements, Close/Terminate,
//!   MakeConnection)
//!
//! - **Workers Layer** (`workers/`): Sender, Invoker and Polling Manager
//!   threads plus housekeeping
//!
//! - **Ports Layer** (`ports/`): Trait definitions
//!   - `ReliableMessagingApi`: Driving port (host API)
//!   - `Transport`, `MessageDeliverer`, `TimeSource`: Driven ports
//!
//! - **Service Layer** (`service`): `RmEngine` implements
//!   `ReliableMessagingApi` and owns the worker threads
//!
//! - **Adapters Layer** (`adapters/`): In-process loopback transport and
//!   recording test doubles
//!
//! ## Invariants
//!
//! - A message number is assigned once, in order, starting at 1
//! - An inbound message is handed to the deliverer at most once
//! - With in-order delivery, message `n` is delivered only after `1..n`
//! - A transaction never spans a transport send
//!
//! ## Usage Example
//!
//! ```ignore
//! use rm_engine::{
//!     CreateSequenceRequest, EndpointReference, LoopbackNetwork, RecordingDeliverer,
//!     ReliableMessagingApi, RmConfig, RmEngine, SendOptions,
//! };
//! use std::sync::Arc;
//!
//! let network = LoopbackNetwork::new();
//! let client = RmEngine::new(
//!     RmConfig::default(),
//!     Arc::new(network.transport()),
//!     Arc::new(RecordingDeliverer::new()),
//! )?;
//! client.start()?;
//!
//! let request = CreateSequenceRequest::new(EndpointReference::new("loop://server"));
//! let sequence = client.create_sequence(request).await?;
//! client.send(&sequence, b"hello".to_vec(), SendOptions::default()).await?;
//! client.terminate_sequence(&sequence).await?;
//! ```

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod processors;
pub mod service;
pub mod store;
pub mod workers;

// Re-exports for convenience
pub use config::{ConfigError, RmConfig};
pub use domain::{
    EndpointReference, FaultKind, MessageRange, MessageType, RangeString, RmEnvelope, RmVersion,
    SequenceFault, SequenceState,
};
pub use error::{RmError, RmResult};
pub use ports::{
    CreateSequenceRequest, Delivery, DeliveryError, IncomingSequenceReport, MessageDeliverer,
    MockTimeSource, ReliableMessagingApi, SendOptions, SequenceReport, SequenceStatus,
    SystemTimeSource, TimeSource, Transport, TransportError,
};
pub use processors::EngineContext;
pub use service::{EngineCore, RmEngine};
pub use store::StorageManager;

pub use adapters::{LoopbackNetwork, LoopbackTransport, RecordingDeliverer, ScriptedTransport};
