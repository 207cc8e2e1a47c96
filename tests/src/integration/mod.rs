//! # Integration Scenarios
//!
//! A client and a server engine joined by a [`LoopbackNetwork`], driven
//! either pass by pass on a mock clock or by their own worker threads.
//!
//! [`LoopbackNetwork`]: rm_engine::LoopbackNetwork

pub mod harness;

mod scenarios;

pub use harness::{Harness, CLIENT, SERVER};
