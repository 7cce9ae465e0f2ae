//! # Integration Event Handlers
//!
//! Application code implements `IntegrationEventHandler<E>` once per event
//! type it reacts to. `HandlerSet` bundles handler registrations so a
//! module can hand all of its handlers to the bus builder at once.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{BusError, HandlerResult};
use crate::event::IntegrationEvent;
use crate::registry::SubscriptionRegistry;
use crate::scope::{HandlerScope, ServiceCollection};

/// Reacts to events of type `E`.
///
/// A new handler instance is resolved from the handler scope for every
/// dispatch unit. Returning an error makes the message go back to the
/// queue after the requeue delay.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    async fn handle(&self, event: &E, cancel: &CancellationToken) -> HandlerResult;
}

type Apply =
    Box<dyn FnOnce(&mut ServiceCollection, &SubscriptionRegistry) -> Result<(), BusError> + Send>;

/// One handler type registered for one event type, with the factory used
/// to build it inside a handler scope.
pub struct HandlerRegistration {
    event_name: String,
    handler_name: &'static str,
    apply: Apply,
}

impl HandlerRegistration {
    pub fn new<E, H, F>(factory: F) -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
        F: Fn(&HandlerScope) -> H + Send + Sync + 'static,
    {
        Self {
            event_name: E::event_name(),
            handler_name: std::any::type_name::<H>(),
            apply: Box::new(move |services, registry| {
                services.add_scoped(factory);
                registry.add_subscription::<E, H>()
            }),
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    /// Register the handler as a scoped service and add its subscription.
    pub(crate) fn apply(
        self,
        services: &mut ServiceCollection,
        registry: &SubscriptionRegistry,
    ) -> Result<(), BusError> {
        (self.apply)(services, registry)
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("event_name", &self.event_name)
            .field("handler", &self.handler_name)
            .finish()
    }
}

/// An ordered collection of handler registrations.
#[derive(Debug, Default)]
pub struct HandlerSet {
    registrations: Vec<HandlerRegistration>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `E` built by `factory`.
    #[must_use]
    pub fn with<E, H, F>(mut self, factory: F) -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
        F: Fn(&HandlerScope) -> H + Send + Sync + 'static,
    {
        self.registrations
            .push(HandlerRegistration::new::<E, H, F>(factory));
        self
    }

    pub fn push(&mut self, registration: HandlerRegistration) {
        self.registrations.push(registration);
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerRegistration> {
        self.registrations.iter()
    }
}

impl IntoIterator for HandlerSet {
    type Item = HandlerRegistration;
    type IntoIter = std::vec::IntoIter<HandlerRegistration>;

    fn into_iter(self) -> Self::IntoIter {
        self.registrations.into_iter()
    }
}
