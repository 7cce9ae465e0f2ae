//! # Bus Errors
//!
//! `BrokerError` is what broker adapters report; `BusError` is what the
//! public API returns.

use thiserror::Error;

/// Errors reported by a broker adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached (refused, DNS, handshake).
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// Socket-level failure on an established connection.
    #[error("Broker I/O error: {0}")]
    Io(String),

    /// The connection is closed.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The channel is closed.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// An exchange or queue does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A mandatory message could not be routed to any queue.
    #[error("Message to exchange '{exchange}' with routing key '{routing_key}' was unroutable")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    /// Any other protocol-level failure.
    #[error("Broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Only network / broker-unreachable conditions qualify.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Io(_))
    }
}

/// Errors returned by the bus API.
#[derive(Debug, Error)]
pub enum BusError {
    /// No open broker connection.
    #[error("No broker connection is available to perform this action")]
    NotConnected,

    /// A broker operation failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Event (de)serialization failed.
    #[error("Event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The handler type is already subscribed to the event.
    #[error("Handler type {handler} already registered for '{event_name}'")]
    DuplicateSubscription { event_name: String, handler: String },

    /// Setup-time misconfiguration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A required service is not registered.
    #[error("Service {type_name} is not registered")]
    ServiceNotFound { type_name: &'static str },

    /// Publishing failed after all retries (or on a non-transient error).
    #[error("Publishing '{event_name}' failed after {attempts} attempt(s): {source}")]
    PublishFailed {
        event_name: String,
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    /// A mandatory publish had no matching binding.
    #[error("Event '{event_name}' could not be routed by exchange '{exchange}'")]
    Unroutable { event_name: String, exchange: String },

    /// One or more handler executions failed for an event.
    #[error("{failed} handler execution(s) failed for '{event_name}': {reason}")]
    HandlerFailed {
        event_name: String,
        failed: usize,
        reason: String,
    },
}

/// Result alias for bus operations.
pub type Result<T, E = BusError> = std::result::Result<T, E>;

/// What handlers and middleware return.
pub type HandlerResult = anyhow::Result<()>;
