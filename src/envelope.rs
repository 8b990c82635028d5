//! Message container for the in-process dispatch queue.
//!
//! A [`MessageEnvelope`] bundles a payload with the handler that will process
//! it. Unlike outbox records, envelopes only live in memory: nothing is
//! persisted, so an envelope still queued at shutdown is lost.
//!
//! ## Design
//!
//! - `P` is the payload type
//! - `C` is the execution context handed to the handler. The pump builds a
//!   fresh one for every envelope, so handlers never share mutable state
//!   through it
//!
//! Handlers are bound when the envelope is created, usually through a
//! [`HandlerRegistry`](crate::dispatch::HandlerRegistry).

use std::{fmt, future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Future returned by an envelope handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), tower::BoxError>> + Send>>;

/// Handler bound into a single envelope.
pub type BoxedHandler<P, C> = Box<dyn FnOnce(P, C) -> HandlerFuture + Send>;

/// A payload and the handler bound to it.
pub struct MessageEnvelope<P, C> {
    id: Uuid,
    created_at: DateTime<Utc>,
    handler_name: String,
    payload: P,
    handler: BoxedHandler<P, C>,
}

impl<P, C> MessageEnvelope<P, C> {
    /// Create an envelope bound to `handler`.
    ///
    /// `handler_name` is only used for logging.
    pub fn new<F, Fut>(handler_name: impl Into<String>, payload: P, handler: F) -> Self
    where
        F: FnOnce(P, C) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), tower::BoxError>> + Send + 'static,
    {
        Self::from_boxed(
            handler_name,
            payload,
            Box::new(move |payload, ctx| Box::pin(handler(payload, ctx))),
        )
    }

    pub(crate) fn from_boxed(
        handler_name: impl Into<String>,
        payload: P,
        handler: BoxedHandler<P, C>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            handler_name: handler_name.into(),
            payload,
            handler,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Run the bound handler with `ctx`.
    pub(crate) fn dispatch(self, ctx: C) -> HandlerFuture {
        (self.handler)(self.payload, ctx)
    }
}

impl<P: fmt::Debug, C> fmt::Debug for MessageEnvelope<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("handler_name", &self.handler_name)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_runs_bound_handler_with_context() {
        let envelope = MessageEnvelope::new(
            "double",
            21_u32,
            |payload, ctx: tokio::sync::oneshot::Sender<u32>| async move {
                ctx.send(payload * 2)
                    .map_err(|_| tower::BoxError::from("receiver dropped"))
            },
        );
        assert_eq!(envelope.handler_name(), "double");
        assert_eq!(*envelope.payload(), 21);

        let (tx, rx) = tokio::sync::oneshot::channel();
        envelope.dispatch(tx).await.unwrap();

        assert_eq!(rx.await.unwrap(), 42);
    }
}
