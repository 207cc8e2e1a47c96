//! # Reliable Messaging Benchmarks
//!
//! Hot-path data structures of the engine.

pub mod bean_store;
pub mod range_string;
