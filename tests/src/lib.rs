//! # RapidBus Test Suite
//!
//! Unified test crate for scenarios that span several components.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── support.rs       # Shared events, handlers and harness
//!     ├── end_to_end.rs    # Publish → consume → ack, fan-out, pipeline
//!     ├── requeue.rs       # Handler failure, requeue delay, isolation
//!     └── recovery.rs      # Connection loss, rebinding, channel errors
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p rapid-bus-tests
//!
//! # By scenario
//! cargo test -p rapid-bus-tests integration::recovery::
//! ```
//!
//! Every scenario runs against `InMemoryBroker`; no broker process is
//! required.

#![allow(unused_variables)]
#![allow(unused_imports)]
#![allow(dead_code)]

pub mod integration;
