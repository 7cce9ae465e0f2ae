//! # Broker Port (Driven Port)
//!
//! The subset of AMQP the bus needs: exchange and queue declaration,
//! bindings, publish, consume, ack/nack and failure signals.
//!
//! Production: `AmqpConnector` (adapters/amqp.rs, feature `amqp`)
//! Testing: `InMemoryBroker` (adapters/memory.rs)

use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, mpsc};

use crate::error::BrokerError;

/// Exchange routing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route on exact routing-key match.
    Direct,
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,
    /// Restricted to the declaring connection.
    pub exclusive: bool,
    /// Deleted when the last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, shared, never auto-deleted.
    #[must_use]
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// AMQP delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Mode 1.
    Transient,
    /// Mode 2, written to disk by the broker.
    #[default]
    Persistent,
}

impl DeliveryMode {
    /// Wire value.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Transient => 1,
            Self::Persistent => 2,
        }
    }
}

/// Basic properties attached to a published message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageProperties {
    pub delivery_mode: DeliveryMode,
    pub app_id: Option<String>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub timestamp: Option<SystemTime>,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used for ack/nack.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    /// Set when the message was delivered before and not acknowledged.
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Failure notifications raised by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// The connection was shut down by either side.
    Shutdown(String),
    /// The broker blocked the connection (resource alarm).
    Blocked(String),
    /// An internal callback failed.
    CallbackError(String),
}

/// Failure notifications raised by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    /// A consumer callback or delivery stream failed.
    CallbackError(String),
    /// The channel was closed by the broker.
    Closed(String),
}

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Open a new connection.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;

    /// Human-readable target, used in logs.
    fn describe(&self) -> String;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;

    /// Subscribe to failure signals.
    fn signals(&self) -> broadcast::Receiver<ConnectionSignal>;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind)
        -> Result<(), BrokerError>;

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publish and wait for the broker to confirm it.
    ///
    /// With `mandatory` set, a message no queue is bound for fails with
    /// `BrokerError::Unroutable`.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    /// Start consuming. Deliveries arrive on the returned receiver, which
    /// closes when the channel does.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Subscribe to failure signals.
    fn signals(&self) -> broadcast::Receiver<ChannelSignal>;

    fn is_open(&self) -> bool;

    /// Close the channel. Unacknowledged deliveries return to their queue.
    async fn close(&self) -> Result<(), BrokerError>;
}
