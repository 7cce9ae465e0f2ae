//! # Event Bus
//!
//! The façade application code talks to. Wires the connection manager,
//! registry, publisher, consumer and dispatcher together.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let bus = EventBus::builder()
//!     .config(BusConfig::from_env()?)
//!     .connector(InMemoryBroker::new())
//!     .add_singleton(Inventory::default())
//!     .use_middleware::<LoggingMiddleware>()
//!     .register_handler::<OrderPlaced, _, _>(|scope| ReserveStock::new(scope))
//!     .build()?;
//!
//! bus.start().await?;
//! bus.publish(&OrderPlaced { order_id: 42 }).await?;
//! bus.shutdown().await;
//! ```

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::BusConfig;
use crate::connection::ConnectionManager;
use crate::consumer::Consumer;
use crate::dispatcher::Dispatcher;
use crate::error::BusError;
use crate::event::IntegrationEvent;
use crate::handler::{HandlerRegistration, HandlerSet, IntegrationEventHandler};
use crate::pipeline::{EventDelegate, FromScope, Middleware, PipelineBuilder};
use crate::ports::broker::BrokerConnector;
use crate::publisher::Publisher;
use crate::registry::SubscriptionRegistry;
use crate::scope::{HandlerScope, ServiceCollection, Services};

/// Collects configuration, services, pipeline steps and handlers.
#[derive(Default)]
pub struct EventBusBuilder {
    config: Option<BusConfig>,
    connector: Option<Arc<dyn BrokerConnector>>,
    services: ServiceCollection,
    pipeline: PipelineBuilder,
    handlers: Vec<HandlerRegistration>,
    /// Misuse detected while building, reported by `build`.
    problems: Vec<String>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Broker to talk to. May be set once.
    #[must_use]
    pub fn connector<C: BrokerConnector + 'static>(self, connector: C) -> Self {
        self.shared_connector(Arc::new(connector))
    }

    #[must_use]
    pub fn shared_connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        if let Some(existing) = &self.connector {
            self.problems.push(format!(
                "broker connector already set to {}, refusing {}",
                existing.describe(),
                connector.describe()
            ));
        } else {
            self.connector = Some(connector);
        }
        self
    }

    #[must_use]
    pub fn add_singleton<T: Send + Sync + 'static>(mut self, instance: T) -> Self {
        self.services.add_singleton(instance);
        self
    }

    #[must_use]
    pub fn add_scoped<T, F>(mut self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&HandlerScope) -> T + Send + Sync + 'static,
    {
        self.services.add_scoped(factory);
        self
    }

    #[must_use]
    pub fn add_transient<T, F>(mut self, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&HandlerScope) -> T + Send + Sync + 'static,
    {
        self.services.add_transient(factory);
        self
    }

    #[must_use]
    pub fn use_step<F>(mut self, step: F) -> Self
    where
        F: Fn(EventDelegate) -> EventDelegate + Send + Sync + 'static,
    {
        self.pipeline = self.pipeline.use_step(step);
        self
    }

    #[must_use]
    pub fn use_middleware<M: Middleware + FromScope>(mut self) -> Self {
        self.pipeline = self.pipeline.use_middleware::<M>();
        self
    }

    #[must_use]
    pub fn use_middleware_instance<M: Middleware>(mut self, middleware: M) -> Self {
        self.pipeline = self.pipeline.use_middleware_instance(middleware);
        self
    }

    /// Register `H` as a scoped service built by `factory` and subscribe it
    /// to `E`.
    #[must_use]
    pub fn register_handler<E, H, F>(mut self, factory: F) -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
        F: Fn(&HandlerScope) -> H + Send + Sync + 'static,
    {
        self.handlers
            .push(HandlerRegistration::new::<E, H, F>(factory));
        self
    }

    #[must_use]
    pub fn register_handlers(mut self, handlers: HandlerSet) -> Self {
        self.handlers.extend(handlers);
        self
    }

    /// Validate everything and assemble the bus. Does not connect.
    ///
    /// # Errors
    ///
    /// - `Configuration` for invalid config, a missing or doubly set
    ///   connector, or middleware that cannot be constructed
    /// - `DuplicateSubscription` when a handler is registered twice for
    ///   the same event
    pub fn build(self) -> Result<EventBus, BusError> {
        if !self.problems.is_empty() {
            return Err(BusError::Configuration(self.problems.join("; ")));
        }

        let config = self.config.unwrap_or_default();
        config.validate()?;

        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector(&config)?,
        };

        let registry = Arc::new(SubscriptionRegistry::new());
        let mut services = self.services;
        for registration in self.handlers {
            registration.apply(&mut services, &registry)?;
        }
        let services = services.build();
        let pipeline = self.pipeline.build(&services)?;

        let connection = ConnectionManager::new(connector, config.reconnect_interval());
        let dispatcher = Arc::new(Dispatcher::new(
            pipeline,
            services.clone(),
            config.max_concurrent_handlers,
        ));
        let publisher = Publisher::new(connection.clone(), Arc::clone(&registry), &config);
        let consumer = Consumer::new(
            connection.clone(),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            &config,
        );

        info!(
            broker = %connection.describe(),
            exchange = %config.exchange_name,
            queue = %config.queue_name,
            events = registry.event_names().len(),
            max_concurrent_handlers = dispatcher.capacity(),
            "Event bus built"
        );

        Ok(EventBus {
            config,
            registry,
            connection,
            services,
            dispatcher,
            publisher,
            consumer,
        })
    }
}

impl std::fmt::Debug for EventBusBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBusBuilder")
            .field("config", &self.config)
            .field("services", &self.services.len())
            .field("pipeline", &self.pipeline)
            .field("handlers", &self.handlers)
            .finish()
    }
}

#[cfg(feature = "amqp")]
fn default_connector(config: &BusConfig) -> Result<Arc<dyn BrokerConnector>, BusError> {
    Ok(Arc::new(crate::adapters::amqp::AmqpConnector::new(
        config.connection_uri.clone(),
    )))
}

#[cfg(not(feature = "amqp"))]
fn default_connector(_config: &BusConfig) -> Result<Arc<dyn BrokerConnector>, BusError> {
    Err(BusError::Configuration(
        "no broker connector set and the `amqp` feature is disabled".into(),
    ))
}

/// A running (or ready to run) event bus.
pub struct EventBus {
    config: BusConfig,
    registry: Arc<SubscriptionRegistry>,
    connection: ConnectionManager,
    services: Services,
    dispatcher: Arc<Dispatcher>,
    publisher: Publisher,
    consumer: Consumer,
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Connect and start consuming. May be called once.
    pub async fn start(&self) -> Result<(), BusError> {
        self.consumer.start().await
    }

    /// Publish `event` to every service subscribed to its name.
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), BusError> {
        self.publisher.publish(event).await
    }

    /// Subscribe `H` to `E` at runtime.
    ///
    /// `H` must be resolvable from the services given to the builder;
    /// otherwise its executions are skipped with a warning. A name seen for
    /// the first time is bound to the queue right away when the bus is
    /// running.
    pub async fn subscribe<E, H>(&self) -> Result<(), BusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_name = E::event_name();
        let first = !self.registry.has_subscriptions(&event_name);
        self.registry.add_subscription::<E, H>()?;

        if !self.services.contains::<H>() {
            warn!(
                event_name = %event_name,
                handler = std::any::type_name::<H>(),
                "Subscribed handler is not a registered service and will be skipped"
            );
        }

        if first {
            self.consumer.add_binding(&event_name).await?;
        }
        Ok(())
    }

    /// Remove the subscription of `H` to `E`. The queue binding goes away
    /// with the last handler for the name.
    pub fn unsubscribe<E, H>(&self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.registry.remove_subscription::<E, H>()
    }

    /// Stop consuming, forget subscriptions and close the connection.
    pub async fn shutdown(&self) {
        self.consumer.stop().await;
        self.registry.clear();
        self.connection.dispose().await;
        info!(queue = %self.config.queue_name, "Event bus shut down");
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn is_started(&self) -> bool {
        self.consumer.is_started()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("connection", &self.connection)
            .field("registry", &self.registry)
            .field("consumer", &self.consumer)
            .finish()
    }
}
