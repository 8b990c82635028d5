use std::{collections::HashMap, future::Future, sync::Arc};

use crate::{
    dispatch::DispatchError,
    envelope::{HandlerFuture, MessageEnvelope},
};

type SharedHandler<P, C> = Arc<dyn Fn(P, C) -> HandlerFuture + Send + Sync>;

/// Named handlers, fixed at startup.
///
/// The registry binds a handler into each envelope it creates, so the pump
/// never looks anything up and there is no handler slot to mutate at runtime.
pub struct HandlerRegistry<P, C> {
    handlers: HashMap<String, SharedHandler<P, C>>,
}

impl<P, C> Default for HandlerRegistry<P, C> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<P, C> Clone for HandlerRegistry<P, C> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<P, C> HandlerRegistry<P, C>
where
    P: Send + 'static,
    C: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(P, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), tower::BoxError>> + Send + 'static,
    {
        let handler: SharedHandler<P, C> =
            Arc::new(move |payload, ctx| Box::pin(handler(payload, ctx)) as HandlerFuture);
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Build an envelope carrying `payload` for the handler named `name`.
    pub fn envelope(&self, name: &str, payload: P) -> Result<MessageEnvelope<P, C>, DispatchError> {
        let handler = self
            .handlers
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| DispatchError::unknown_handler(name))?;

        Ok(MessageEnvelope::from_boxed(
            name,
            payload,
            Box::new(move |payload, ctx| handler(payload, ctx)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchErrorKind;
    use std::sync::Mutex;

    #[tokio::test]
    async fn envelope_is_bound_to_registered_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::<u32, ()>::new().register("record", {
            let seen = Arc::clone(&seen);
            move |payload, _ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(payload);
                    Ok(())
                }
            }
        });

        let envelope = registry.envelope("record", 7).unwrap();
        assert_eq!(envelope.handler_name(), "record");
        envelope.dispatch(()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn unknown_handler_is_an_error() {
        let registry = HandlerRegistry::<u32, ()>::new();

        let err = registry.envelope("missing", 1).unwrap_err();

        assert!(!registry.contains("missing"));
        assert_eq!(
            *err.kind(),
            DispatchErrorKind::UnknownHandler("missing".to_owned())
        );
    }
}
