//! # Adapters Layer
//!
//! Implementations of the broker port.
//!
//! - `memory` - in-process broker for tests and local runs
//! - `amqp` - RabbitMQ and other AMQP 0-9-1 brokers via `lapin`
//!   (feature `amqp`)

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use memory::{BrokerOp, BrokerStats, InMemoryBroker, PublishedMessage};
