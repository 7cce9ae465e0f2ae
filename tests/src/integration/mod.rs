//! # Integration Scenarios
//!
//! Each module drives a fully built `EventBus` through the in-memory broker.

#[cfg(test)]
mod support;

pub mod end_to_end;
pub mod recovery;
pub mod requeue;
