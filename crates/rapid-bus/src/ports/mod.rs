//! # Ports Layer
//!
//! The broker operations the bus depends on.
//!
//! - `broker.rs` - Driven port implemented by `adapters::memory` and
//!   `adapters::amqp`

pub mod broker;

pub use broker::{
    BrokerChannel, BrokerConnection, BrokerConnector, ChannelSignal, ConnectionSignal, Delivery,
    DeliveryMode, ExchangeKind, MessageProperties, QueueOptions,
};
