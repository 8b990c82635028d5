//! Broker transport abstractions and sender backends.
//!
//! This module defines a Tower-compatible transport layer used to send
//! [`BrokerMessage`]s through different backends (e.g. in-memory, Kafka,
//! RabbitMQ).
//!
//! The transport is built around Tower’s `Service` abstraction, enabling
//! middleware composition (timeouts, tracing, rate limits) while keeping
//! sender implementations backend-agnostic.
//!
//! ## Key components
//!
//! - [`BrokerMessage`]: What the relay hands to the broker
//! - [`Transport`]: Public-facing wrapper implementing `tower::Service`
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by concrete sender backends
//! - [`TransportError`]: Unified error type with tracing context
//! - [`Rejected`]: Marker a sender wraps around errors retrying cannot fix

mod inmemory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub mod layers;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::{Service, ServiceExt as _};
use tracing_error::SpanTrace;

use crate::outbox::OutboxRecord;

pub use inmemory::InMemory;

/// Content type of every outbox payload.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Metadata key carrying the W3C `traceparent`.
pub const TRACE_PARENT: &str = "traceparent";
/// Metadata key carrying the W3C `tracestate`.
pub const TRACE_STATE: &str = "tracestate";
/// Metadata key carrying the record creation time (RFC 3339).
pub const CREATED_AT: &str = "created_at";

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Topic, exchange routing key or queue the message is sent to.
    pub destination: String,
    /// Stable id consumers use to drop duplicates.
    pub message_id: String,
    /// Logical event name.
    pub subject: String,
    /// MIME type of `body`.
    pub content_type: String,
    /// Raw payload.
    pub body: Vec<u8>,
    /// Free-form string headers.
    pub metadata: BTreeMap<String, String>,
}

impl BrokerMessage {
    /// Build the broker message announcing an outbox record.
    ///
    /// The record id becomes the message id so that a redelivered record can
    /// be recognised by consumers.
    pub fn from_record(record: &OutboxRecord, destination: impl Into<String>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(CREATED_AT.to_owned(), record.created_at.to_rfc3339());
        if let Some(parent) = record.trace_parent.as_deref().filter(|s| !s.trim().is_empty()) {
            metadata.insert(TRACE_PARENT.to_owned(), parent.to_owned());
        }
        if let Some(state) = record.trace_state.as_deref().filter(|s| !s.trim().is_empty()) {
            metadata.insert(TRACE_STATE.to_owned(), state.to_owned());
        }

        Self {
            destination: destination.into(),
            message_id: record.id.to_string(),
            subject: record.event_name.clone(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            body: record.event_content.clone().into_bytes(),
            metadata,
        }
    }
}

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the main entry point for sending messages. It wraps an
/// underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Provides a convenience [`send`](Transport::send) API
///
/// Typically constructed from a concrete [`Sender`] implementation.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender backend.
    ///
    /// The sender will be wrapped in a [`SenderService`] to make it
    /// Tower-compatible.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Wrap an existing Tower service.
    pub fn from_service(service: S) -> Self {
        Self { service }
    }

    /// Apply a Tower layer to the transport.
    ///
    /// This enables composition with middleware such as timeouts, rate
    /// limits, or tracing.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }
}

/// Tower `Service` implementation for `Transport`.
///
/// Delegates readiness and request handling to the inner service while mapping
/// all errors into [`TransportError`].
impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::classify(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        let mut service = self.service.clone();

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::classify(e.into()))?;
            Ok(())
        })
    }
}

impl<S> Transport<S>
where
    S: Service<BrokerMessage> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    /// Send a [`BrokerMessage`] and wait for the broker acknowledgement.
    ///
    /// Waits for the service to be ready first, so layers that apply
    /// backpressure (rate limits, concurrency limits) are honoured.
    pub async fn send(&mut self, message: BrokerMessage) -> Result<(), TransportError> {
        let mut service = self.service.clone();
        service
            .ready()
            .await
            .map_err(|e| TransportError::classify(e.into()))?
            .call(message)
            .await
            .map_err(|e| TransportError::classify(e.into()))?;
        Ok(())
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The backend could not deliver the message right now.
    Sender(tower::BoxError),
    /// The backend refused the message; sending it again will not help.
    Rejected(tower::BoxError),
    /// Errors related to serialization or deserialization.
    Serde(tower::BoxError),
}

impl TransportError {
    /// Create a sender-related transport error.
    pub fn sender(err: tower::BoxError) -> Self {
        Self::new(TransportErrorKind::Sender(err))
    }

    /// Create a permanent rejection error.
    pub fn rejected(err: tower::BoxError) -> Self {
        Self::new(TransportErrorKind::Rejected(err))
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: tower::BoxError) -> Self {
        Self::new(TransportErrorKind::Serde(err))
    }

    fn new(kind: TransportErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// Turn a boxed error coming out of a service stack into a
    /// `TransportError`, keeping the classification of errors that already
    /// carry one.
    pub fn classify(err: tower::BoxError) -> Self {
        let err = match err.downcast::<TransportError>() {
            Ok(err) => return *err,
            Err(err) => err,
        };
        match err.downcast::<Rejected>() {
            Ok(rejected) => Self::rejected(rejected.0),
            Err(err) => Self::sender(err),
        }
    }

    /// The error classification.
    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    /// Whether retrying the same message cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Rejected(_) | TransportErrorKind::Serde(_)
        )
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Rejected(err) => writeln!(f, "Message rejected: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Rejected(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err.as_ref()),
        }
    }
}

/// Marks a sender error as permanent.
///
/// Senders return `Rejected` (boxed) when the broker refused the message
/// itself, e.g. because it is too large or the destination forbids it.
/// [`TransportError::classify`] recognises it through any number of layers.
#[derive(Debug)]
pub struct Rejected(pub tower::BoxError);

impl Rejected {
    /// Wrap an error as a permanent rejection.
    pub fn new(err: impl Into<tower::BoxError>) -> Self {
        Self(err.into())
    }
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Rejected {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Tower service adapter for a [`Sender`] backend.
///
/// This type bridges the [`Sender`] trait with Tower’s `Service` abstraction.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<D> Service<BrokerMessage> for SenderService<D>
where
    D: Sender + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: BrokerMessage) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by concrete sender backends.
///
/// A sender is responsible for delivering a [`BrokerMessage`] to an external
/// system (e.g. Kafka, RabbitMQ, or an in-memory queue) and returning only
/// once the broker acknowledged it.
#[async_trait::async_trait]
pub trait Sender {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Send a message using the underlying transport.
    async fn send(&mut self, message: BrokerMessage) -> Result<(), Self::Error>;
}
