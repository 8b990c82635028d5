//! Static routing from event names to broker destinations.
//!
//! The [`TopicRouter`] is built once at startup and never mutated afterwards.
//! It is consulted by the [`TransactionalWriter`](crate::TransactionalWriter)
//! to reject unroutable events before they are committed, and by the
//! [`OutboxRelay`](crate::OutboxRelay) to pick the destination of every
//! record it publishes.
//!
//! Event names are matched case-insensitively.

use std::{collections::HashMap, sync::Arc};

/// Immutable event name to destination lookup table.
///
/// Cloning is cheap: the table is shared behind an [`Arc`].
///
/// ```rust
/// use eventrelay::TopicRouter;
///
/// let router = TopicRouter::new().route("PaymentCreated", "payments");
///
/// assert_eq!(router.resolve("paymentcreated"), Ok("payments"));
/// assert!(router.resolve("RefundIssued").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct TopicRouter {
    routes: Arc<HashMap<String, String>>,
}

impl TopicRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route, returning the extended router.
    ///
    /// A later route for the same event name replaces the earlier one.
    pub fn route(self, event_name: impl AsRef<str>, destination: impl Into<String>) -> Self {
        let mut routes = Arc::unwrap_or_clone(self.routes);
        routes.insert(normalize(event_name.as_ref()), destination.into());
        Self {
            routes: Arc::new(routes),
        }
    }

    /// Resolve the destination for an event name.
    pub fn resolve(&self, event_name: &str) -> Result<&str, RoutingError> {
        if event_name.trim().is_empty() {
            return Err(RoutingError::BlankEventName);
        }

        self.routes
            .get(&normalize(event_name))
            .map(String::as_str)
            .ok_or_else(|| RoutingError::NotFound(event_name.to_owned()))
    }

    /// Whether a destination exists for the event name.
    pub fn contains(&self, event_name: &str) -> bool {
        self.resolve(event_name).is_ok()
    }

    /// Number of configured routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no route is configured.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for TopicRouter
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(TopicRouter::new(), |router, (name, destination)| {
                router.route(name, destination)
            })
    }
}

fn normalize(event_name: &str) -> String {
    event_name.trim().to_lowercase()
}

/// Error returned when an event name cannot be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The event name is empty or whitespace.
    BlankEventName,
    /// No destination is mapped for the event name.
    NotFound(String),
}

impl std::fmt::Display for RoutingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingError::BlankEventName => write!(f, "Event name cannot be blank"),
            RoutingError::NotFound(name) => {
                write!(f, "No destination mapping found for event '{name}'")
            }
        }
    }
}

impl std::error::Error for RoutingError {}
