//! # Subscription Registry
//!
//! Single source of truth for routing: event name to event type (with its
//! decoder) and event name to the ordered handler subscriptions.
//!
//! ## Invariants
//!
//! - An event name has a registered type iff it has at least one subscription
//! - A handler type appears at most once per event name
//! - Removing the last subscription of a name broadcasts `event_removed`
//!   exactly once
//!
//! Both maps sit behind one `RwLock`, so readers never observe a name with
//! a type but no handlers (or the reverse).

use async_trait::async_trait;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::context::EventContext;
use crate::error::{BusError, HandlerResult};
use crate::event::{short_type_name, IntegrationEvent};
use crate::handler::IntegrationEventHandler;

const REMOVED_CHANNEL_CAPACITY: usize = 64;

pub(crate) type DecodedEvent = Arc<dyn Any + Send + Sync>;
type Decoder = Arc<dyn Fn(&[u8]) -> Result<DecodedEvent, serde_json::Error> + Send + Sync>;

/// Identity of a registered event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventType {
    id: TypeId,
    name: &'static str,
}

impl EventType {
    pub fn of<E: 'static>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: std::any::type_name::<E>(),
        }
    }

    /// Fully qualified Rust type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<E: 'static>(&self) -> bool {
        self.id == TypeId::of::<E>()
    }
}

/// Identity of a handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerType {
    id: TypeId,
    name: &'static str,
}

impl HandlerType {
    pub fn of<H: 'static>() -> Self {
        Self {
            id: TypeId::of::<H>(),
            name: std::any::type_name::<H>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without its module path.
    pub fn short_name(&self) -> &'static str {
        short_type_name(self.name)
    }
}

/// Runs the concrete handler of one subscription against a context.
#[async_trait]
pub(crate) trait EventInvoker: Send + Sync {
    async fn invoke(&self, ctx: &EventContext) -> HandlerResult;
}

struct TypedInvoker<E, H>(PhantomData<fn() -> (E, H)>);

#[async_trait]
impl<E, H> EventInvoker for TypedInvoker<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    async fn invoke(&self, ctx: &EventContext) -> HandlerResult {
        let Some(handler) = ctx.scope().resolve::<H>() else {
            warn!(
                event_name = %ctx.event_name(),
                handler = std::any::type_name::<H>(),
                "Handler is not registered as a service, skipping"
            );
            return Ok(());
        };
        let event = ctx.event::<E>().ok_or_else(|| {
            anyhow::anyhow!(
                "context for '{}' does not carry a {}",
                ctx.event_name(),
                std::any::type_name::<E>()
            )
        })?;
        handler.handle(event, ctx.cancellation()).await
    }
}

/// One (event name, handler type) binding.
#[derive(Clone)]
pub struct Subscription {
    event_name: String,
    event_type: EventType,
    handler_type: HandlerType,
    invoker: Arc<dyn EventInvoker>,
}

impl Subscription {
    fn new<E, H>(event_name: String) -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        Self {
            event_name,
            event_type: EventType::of::<E>(),
            handler_type: HandlerType::of::<H>(),
            invoker: Arc::new(TypedInvoker::<E, H>(PhantomData)),
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn handler_type(&self) -> HandlerType {
        self.handler_type
    }

    pub(crate) async fn invoke(&self, ctx: &EventContext) -> HandlerResult {
        self.invoker.invoke(ctx).await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event_name", &self.event_name)
            .field("event_type", &self.event_type.name)
            .field("handler_type", &self.handler_type.name)
            .finish()
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.event_name == other.event_name && self.handler_type == other.handler_type
    }
}

impl Eq for Subscription {}

/// Everything the consumer needs to dispatch one delivery, read under a
/// single lock.
pub(crate) struct Route {
    pub event_type: EventType,
    decoder: Decoder,
    pub subscriptions: Vec<Subscription>,
}

impl Route {
    pub fn decode(&self, body: &[u8]) -> Result<DecodedEvent, serde_json::Error> {
        (self.decoder)(body)
    }
}

struct RegisteredEvent {
    event_type: EventType,
    decoder: Decoder,
}

#[derive(Default)]
struct Inner {
    events: HashMap<String, RegisteredEvent>,
    handlers: HashMap<String, Vec<Subscription>>,
}

/// In-memory routing table shared by the publisher, the consumer and the
/// registration API.
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
    removed: broadcast::Sender<String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        let (removed, _) = broadcast::channel(REMOVED_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            removed,
        }
    }

    /// Canonical name of `E`.
    pub fn event_name<E: IntegrationEvent>(&self) -> String {
        E::event_name()
    }

    /// Bind handler `H` to event `E`.
    ///
    /// # Errors
    ///
    /// `DuplicateSubscription` if `H` is already bound to the name;
    /// `Configuration` if the name is already taken by a different event type.
    pub fn add_subscription<E, H>(&self) -> Result<(), BusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_name = E::event_name();
        let handler_type = HandlerType::of::<H>();
        let mut inner = self.inner.write();

        if let Some(registered) = inner.events.get(&event_name) {
            if !registered.event_type.is::<E>() {
                return Err(BusError::Configuration(format!(
                    "event name '{}' is already registered for {}",
                    event_name, registered.event_type.name
                )));
            }
        }

        let handlers = inner.handlers.entry(event_name.clone()).or_default();
        if handlers.iter().any(|s| s.handler_type == handler_type) {
            return Err(BusError::DuplicateSubscription {
                event_name,
                handler: handler_type.name.to_string(),
            });
        }
        handlers.push(Subscription::new::<E, H>(event_name.clone()));

        inner
            .events
            .entry(event_name.clone())
            .or_insert_with(|| RegisteredEvent {
                event_type: EventType::of::<E>(),
                decoder: Arc::new(|body: &[u8]| {
                    serde_json::from_slice::<E>(body).map(|event| Arc::new(event) as DecodedEvent)
                }),
            });

        debug!(
            event_name = %event_name,
            handler = handler_type.short_name(),
            "Subscription added"
        );
        Ok(())
    }

    /// Unbind handler `H` from event `E`. Returns `false` if it was not bound.
    pub fn remove_subscription<E, H>(&self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_name = E::event_name();
        let handler_type = HandlerType::of::<H>();

        let last_removed = {
            let mut inner = self.inner.write();
            let Some(handlers) = inner.handlers.get_mut(&event_name) else {
                return false;
            };
            let Some(position) = handlers.iter().position(|s| s.handler_type == handler_type)
            else {
                return false;
            };
            handlers.remove(position);

            if handlers.is_empty() {
                inner.handlers.remove(&event_name);
                inner.events.remove(&event_name);
                true
            } else {
                false
            }
        };

        debug!(
            event_name = %event_name,
            handler = handler_type.short_name(),
            last = last_removed,
            "Subscription removed"
        );

        if last_removed {
            // No receivers is fine.
            let _ = self.removed.send(event_name);
        }
        true
    }

    pub fn has_subscriptions(&self, event_name: &str) -> bool {
        self.inner.read().handlers.contains_key(event_name)
    }

    /// Subscriptions for `event_name` in registration order; empty when none.
    pub fn handlers(&self, event_name: &str) -> Vec<Subscription> {
        self.inner
            .read()
            .handlers
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn event_type_for(&self, event_name: &str) -> Option<EventType> {
        self.inner
            .read()
            .events
            .get(event_name)
            .map(|registered| registered.event_type)
    }

    /// Owned copy of every subscription, keyed by event name.
    pub fn all_subscriptions(&self) -> HashMap<String, Vec<Subscription>> {
        self.inner.read().handlers.clone()
    }

    /// Names with at least one subscription, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().handlers.is_empty()
    }

    /// Drop every subscription. Does not broadcast removals.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.handlers.clear();
        inner.events.clear();
    }

    /// Receives the name of each event whose last subscription was removed.
    pub fn event_removed(&self) -> broadcast::Receiver<String> {
        self.removed.subscribe()
    }

    pub(crate) fn route(&self, event_name: &str) -> Option<Route> {
        let inner = self.inner.read();
        let registered = inner.events.get(event_name)?;
        let subscriptions = inner.handlers.get(event_name)?.clone();
        Some(Route {
            event_type: registered.event_type,
            decoder: Arc::clone(&registered.decoder),
            subscriptions,
        })
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("event_names", &self.event_names())
            .finish()
    }
}
