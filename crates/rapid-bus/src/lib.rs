//! # RapidBus - Integration Event Bus
//!
//! Publishes and consumes integration events through an AMQP-style broker
//! (direct exchange, one durable queue per service, routing key = event
//! name).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  publish()  ┌───────────┐            ┌──────────────┐
//! │  Publisher   │ ──────────▶ │  Broker   │ ─────────▶ │   Consumer   │
//! │ (retry, ids) │             │ (exchange │  deliver   │ (ack / nack) │
//! └──────────────┘             │  + queue) │            └──────┬───────┘
//!         ▲                    └───────────┘                   │
//!         │                          ▲                         ▼
//!  ┌──────┴──────────────────────────┴──────┐      ┌───────────────────┐
//!  │           ConnectionManager            │      │    Dispatcher     │
//!  │   (reconnect, Recovered notification)  │      │ gate ─▶ pipeline  │
//!  └────────────────────────────────────────┘      │      ─▶ handler   │
//!                                                  └───────────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once:** a delivery is acked only after every handler for
//!   its event succeeded; failures are requeued after a delay
//! - **Reconnection transparency:** the consumer re-declares and re-binds
//!   after every connection recovery
//! - **Bounded concurrency:** at most `max_concurrent_handlers` handler
//!   executions run at once

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod adapters;
pub mod bus;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handler;
pub mod pipeline;
pub mod ports;
pub mod publisher;
pub mod registry;
pub mod scope;

// Re-export main types
pub use adapters::InMemoryBroker;
#[cfg(feature = "amqp")]
pub use adapters::AmqpConnector;
pub use bus::{EventBus, EventBusBuilder};
pub use config::BusConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use context::EventContext;
pub use error::{BrokerError, BusError, HandlerResult, Result};
pub use event::IntegrationEvent;
pub use handler::{HandlerRegistration, HandlerSet, IntegrationEventHandler};
pub use pipeline::{delegate, EventDelegate, FromScope, Middleware, Pipeline, PipelineBuilder};
pub use registry::{EventType, HandlerType, Subscription, SubscriptionRegistry};
pub use scope::{HandlerScope, ServiceCollection, Services};

/// Re-exported so handler signatures need no direct `tokio-util` dependency.
pub use tokio_util::sync::CancellationToken;
