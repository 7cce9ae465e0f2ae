//! # Integration Events
//!
//! Application payloads carried over the bus. The canonical event name is
//! the routing key on the wire.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// An application-defined event that can be published and consumed.
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced { id: String }
///
/// impl IntegrationEvent for OrderPlaced {
///     const NAME: Option<&'static str> = Some("orders.placed");
/// }
/// ```
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Explicit event name. When `None` the type's own name is used.
    const NAME: Option<&'static str> = None;

    /// Canonical event name used as the broker routing key.
    fn event_name() -> String {
        match Self::NAME {
            Some(name) => name.to_string(),
            None => default_event_name::<Self>(),
        }
    }
}

/// Name derived from the type itself: the last path segment of
/// `std::any::type_name`, without generic arguments.
#[must_use]
pub fn default_event_name<T: ?Sized>() -> String {
    short_type_name(std::any::type_name::<T>()).to_string()
}

pub(crate) fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
