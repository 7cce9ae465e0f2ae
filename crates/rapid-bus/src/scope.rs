//! # Services and Handler Scopes
//!
//! A small typed service registry. Handlers and middleware are resolved
//! from a `HandlerScope` created for each dispatch unit, so scoped
//! services never leak between messages.
//!
//! | Lifetime  | Instance                                   |
//! |-----------|--------------------------------------------|
//! | Singleton | one, shared by every scope                 |
//! | Scoped    | one per `HandlerScope`, dropped with it    |
//! | Transient | a new one on every `resolve`               |

use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::BusError;

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&HandlerScope) -> Instance + Send + Sync>;

enum Registration {
    Singleton(Instance),
    Scoped(Factory),
    Transient(Factory),
}

/// Mutable set of service registrations. Frozen by `build`.
#[derive(Default)]
pub struct ServiceCollection {
    registrations: HashMap<TypeId, Registration>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared instance. Replaces any earlier registration of `T`.
    pub fn add_singleton<T: Send + Sync + 'static>(&mut self, instance: T) -> &mut Self {
        self.registrations
            .insert(TypeId::of::<T>(), Registration::Singleton(Arc::new(instance)));
        self
    }

    /// Register a factory invoked once per scope.
    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&HandlerScope) -> T + Send + Sync + 'static,
    {
        self.registrations.insert(
            TypeId::of::<T>(),
            Registration::Scoped(Arc::new(move |scope| Arc::new(factory(scope)) as Instance)),
        );
        self
    }

    /// Register a factory invoked on every resolve.
    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&HandlerScope) -> T + Send + Sync + 'static,
    {
        self.registrations.insert(
            TypeId::of::<T>(),
            Registration::Transient(Arc::new(move |scope| Arc::new(factory(scope)) as Instance)),
        );
        self
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.registrations.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Freeze the registrations.
    pub fn build(self) -> Services {
        Services {
            registrations: Arc::new(self.registrations),
        }
    }
}

/// Immutable service registrations. Cheap to clone.
#[derive(Clone)]
pub struct Services {
    registrations: Arc<HashMap<TypeId, Registration>>,
}

impl Services {
    /// Start a new resolution scope.
    pub fn create_scope(&self) -> HandlerScope {
        HandlerScope {
            services: self.clone(),
            scoped: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.registrations.contains_key(&TypeId::of::<T>())
    }
}

impl Default for Services {
    fn default() -> Self {
        ServiceCollection::new().build()
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("registrations", &self.registrations.len())
            .finish()
    }
}

/// Service resolution boundary for one dispatch unit.
///
/// Clones share the same scoped instances.
#[derive(Clone)]
pub struct HandlerScope {
    services: Services,
    scoped: Arc<Mutex<HashMap<TypeId, Instance>>>,
}

impl HandlerScope {
    /// Resolve `T`, or `None` when it is not registered.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let id = TypeId::of::<T>();
        let instance = match self.services.registrations.get(&id)? {
            Registration::Singleton(instance) => Arc::clone(instance),
            Registration::Transient(factory) => factory(self),
            Registration::Scoped(factory) => {
                let cached = self.scoped.lock().get(&id).cloned();
                match cached {
                    Some(instance) => instance,
                    None => {
                        // Factory runs unlocked: it may resolve other scoped services.
                        let created = factory(self);
                        Arc::clone(self.scoped.lock().entry(id).or_insert(created))
                    }
                }
            }
        };
        instance.downcast::<T>().ok()
    }

    /// Resolve `T`, failing with `BusError::ServiceNotFound`.
    pub fn require<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, BusError> {
        self.resolve::<T>().ok_or(BusError::ServiceNotFound {
            type_name: std::any::type_name::<T>(),
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }
}
