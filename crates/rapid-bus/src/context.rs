//! # Event Context
//!
//! Per-execution state threaded through the pipeline: the decoded event,
//! its name, the handler scope, the session cancellation token and a
//! key/value bag steps use to talk to each other.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::scope::HandlerScope;

struct ContextInner {
    event: Arc<dyn Any + Send + Sync>,
    event_name: String,
    scope: HandlerScope,
    cancellation: CancellationToken,
    items: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

/// Context for one pipeline execution.
///
/// Clones share the same item bag; a fresh context is built for every
/// dispatch unit.
#[derive(Clone)]
pub struct EventContext {
    inner: Arc<ContextInner>,
}

impl EventContext {
    pub fn new(
        event_name: impl Into<String>,
        event: Arc<dyn Any + Send + Sync>,
        scope: HandlerScope,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                event,
                event_name: event_name.into(),
                scope,
                cancellation,
                items: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The decoded event, if it is an `E`.
    pub fn event<E: Any>(&self) -> Option<&E> {
        self.inner.event.downcast_ref::<E>()
    }

    pub fn event_name(&self) -> &str {
        &self.inner.event_name
    }

    pub fn scope(&self) -> &HandlerScope {
        &self.inner.scope
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Store a value under `key`, replacing any previous one.
    pub fn set_item<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.items.lock().insert(key.into(), Box::new(value));
    }

    /// A copy of the value under `key`, if present and of type `T`.
    pub fn item<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.inner
            .items
            .lock()
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Mutate the value under `key` in place, inserting `T::default()`
    /// first when absent or of another type.
    pub fn update_item<T, F>(&self, key: &str, f: F)
    where
        T: Any + Send + Sync + Default,
        F: FnOnce(&mut T),
    {
        let mut items = self.inner.items.lock();
        let slot = items
            .entry(key.to_string())
            .or_insert_with(|| Box::new(T::default()));
        if !slot.is::<T>() {
            *slot = Box::new(T::default());
        }
        if let Some(value) = slot.downcast_mut::<T>() {
            f(value);
        }
    }

    pub fn remove_item(&self, key: &str) -> bool {
        self.inner.items.lock().remove(key).is_some()
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("event_name", &self.inner.event_name)
            .field("items", &self.inner.items.lock().len())
            .field("cancelled", &self.inner.cancellation.is_cancelled())
            .finish()
    }
}
