//! # Reliable Messaging Test Suite
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── benchmarks/       # RangeString and bean store performance
//! │   ├── range_string.rs
//! │   └── bean_store.rs
//! │
//! └── integration/      # Two engines over the loopback network
//!     ├── harness.rs
//!     └── scenarios.rs
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p rm-tests
//!
//! # Scenarios only
//! cargo test -p rm-tests integration::
//!
//! # Benchmarks
//! cargo bench -p rm-tests
//! ```

pub mod benchmarks;
pub mod integration;
