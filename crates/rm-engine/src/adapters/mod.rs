//! Adapters layer: transport and delivery bindings.
//!
//! - `loopback`: in-process network joining several engines
//! - `scripted`: controllable transport for unit tests
//! - `recording`: message deliverer that records what it is handed

pub mod loopback;
pub mod recording;
pub mod scripted;

pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use recording::RecordingDeliverer;
pub use scripted::{Responder, ScriptedTransport};
