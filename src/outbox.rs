//! Outbox records, store traits and backend drivers.
//!
//! This module implements the storage half of the *outbox pattern*: an
//! ordered, durable table of announcements that is written in the same
//! transaction as the domain change it describes, and later drained by the
//! [`OutboxRelay`](crate::OutboxRelay).
//!
//! The outbox is responsible for **durability and ordering**, while delivery
//! concerns are delegated to the relay and transport layers.
//!
//! ## Responsibilities
//!
//! - Persist records atomically with application state
//! - Return pending records oldest first
//! - Flip records to delivered, exactly once
//!
//! ## Components
//!
//! - [`OutboxRecord`]: One stored announcement
//! - [`NewOutboxEvent`]: An announcement that has not been stored yet
//! - [`Transactional`] and [`InsertRecords`]: Atomic insertion
//! - [`FetchPending`]: Ordered reads of undelivered records
//! - [`MarkDelivered`]: Idempotent delivery acknowledgement
//!
//! Concrete implementations are provided by backend modules such as
//! [`inmemory`] and [`sqlx`] (feature-gated). Records are never deleted by
//! this crate; retention is left to the operator.

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::router::RoutingError;

/// Error returned by outbox operations.
///
/// Wraps the underlying cause and captures a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    kind: OutboxErrorKind,
}

/// Classification of outbox errors.
#[derive(Debug)]
pub enum OutboxErrorKind {
    /// The storage backend failed. Nothing was committed.
    Backend(tower::BoxError),
    /// The domain change failed. Nothing was committed.
    Domain(tower::BoxError),
    /// The event name has no destination and was rejected before writing.
    Unroutable(RoutingError),
    /// The event payload could not be serialized.
    Serde(serde_json::Error),
}

impl OutboxError {
    pub(crate) fn backend(err: impl Into<tower::BoxError>) -> Self {
        Self::new(OutboxErrorKind::Backend(err.into()))
    }

    pub(crate) fn domain(err: tower::BoxError) -> Self {
        Self::new(OutboxErrorKind::Domain(err))
    }

    pub(crate) fn unroutable(err: RoutingError) -> Self {
        Self::new(OutboxErrorKind::Unroutable(err))
    }

    fn serde(err: serde_json::Error) -> Self {
        Self::new(OutboxErrorKind::Serde(err))
    }

    fn new(kind: OutboxErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// The error classification.
    pub fn kind(&self) -> &OutboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OutboxErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
            OutboxErrorKind::Domain(err) => writeln!(f, "Domain change failed: {err}"),
            OutboxErrorKind::Unroutable(err) => writeln!(f, "Unroutable event: {err}"),
            OutboxErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            OutboxErrorKind::Backend(err) => Some(err.as_ref()),
            OutboxErrorKind::Domain(err) => Some(err.as_ref()),
            OutboxErrorKind::Unroutable(err) => Some(err),
            OutboxErrorKind::Serde(err) => Some(err),
        }
    }
}

/// A stored announcement.
///
/// A record is either pending (`delivered == false`) or delivered with
/// `delivered_at` set. The transition happens once and never reverts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Time-ordered unique identifier, also used as the broker message id.
    pub id: Uuid,
    /// Logical event type, used for routing.
    pub event_name: String,
    /// Serialized payload. Opaque to this crate.
    pub event_content: String,
    /// Insertion time, the ordering key.
    pub created_at: DateTime<Utc>,
    /// Whether the broker acknowledged the record.
    pub delivered: bool,
    /// When the record was marked delivered.
    pub delivered_at: Option<DateTime<Utc>>,
    /// W3C `traceparent` of the originating operation.
    pub trace_parent: Option<String>,
    /// W3C `tracestate` of the originating operation.
    pub trace_state: Option<String>,
}

impl OutboxRecord {
    /// Whether the record still awaits delivery.
    pub fn is_pending(&self) -> bool {
        !self.delivered
    }

    /// Flip the record to delivered.
    ///
    /// Returns `false`, leaving `delivered_at` untouched, when the record was
    /// already delivered.
    pub(crate) fn mark_delivered(&mut self, at: DateTime<Utc>) -> bool {
        if self.delivered {
            return false;
        }
        self.delivered = true;
        self.delivered_at = Some(at);
        true
    }
}

/// An announcement to be written to the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEvent {
    /// Logical event type, used for routing.
    pub event_name: String,
    /// Serialized payload.
    pub event_content: String,
    /// Optional W3C `traceparent`.
    pub trace_parent: Option<String>,
    /// Optional W3C `tracestate`.
    pub trace_state: Option<String>,
}

impl NewOutboxEvent {
    /// Create an event from an already serialized payload.
    pub fn new(event_name: impl Into<String>, event_content: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            event_content: event_content.into(),
            trace_parent: None,
            trace_state: None,
        }
    }

    /// Create an event whose content is the JSON encoding of `payload`.
    pub fn json<T: Serialize + ?Sized>(
        event_name: impl Into<String>,
        payload: &T,
    ) -> Result<Self, OutboxError> {
        let content = serde_json::to_string(payload).map_err(OutboxError::serde)?;
        Ok(Self::new(event_name, content))
    }

    /// Attach trace correlation headers.
    pub fn with_trace_context(
        mut self,
        trace_parent: impl Into<String>,
        trace_state: Option<String>,
    ) -> Self {
        self.trace_parent = Some(trace_parent.into());
        self.trace_state = trace_state;
        self
    }

    /// Turn the event into a pending record stamped with `now`.
    ///
    /// Timestamps are truncated to microseconds so that they survive a round
    /// trip through `TIMESTAMPTZ` unchanged.
    pub(crate) fn into_record(self, now: DateTime<Utc>) -> OutboxRecord {
        OutboxRecord {
            id: Uuid::now_v7(),
            event_name: self.event_name,
            event_content: self.event_content,
            created_at: now.trunc_subsecs(6),
            delivered: false,
            delivered_at: None,
            trace_parent: self.trace_parent,
            trace_state: self.trace_state,
        }
    }
}

/// Backend able to group writes into one atomic unit.
///
/// Dropping a transaction without passing it to [`commit`](Self::commit)
/// must discard every write made through it.
#[async_trait::async_trait]
pub trait Transactional {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;
    /// Open unit of work.
    type Transaction: Send;

    /// Open a new transaction.
    async fn begin(&self) -> Result<Self::Transaction, Self::Error>;

    /// Commit every write made through `tx`.
    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error>;
}

/// Trait for inserting records into the outbox.
///
/// Implementations must ensure durability and transactional guarantees.
#[async_trait::async_trait]
pub trait InsertRecords: Transactional {
    /// Insert records inside an open transaction.
    async fn insert_records(
        &self,
        records: Vec<OutboxRecord>,
        tx: &mut Self::Transaction,
    ) -> Result<(), Self::Error>;
}

/// Trait for reading pending records.
#[async_trait::async_trait]
pub trait FetchPending {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Return up to `limit` undelivered records, oldest `created_at` first.
    async fn next_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, Self::Error>;

    /// Number of undelivered records.
    async fn pending_count(&self) -> Result<u64, Self::Error>;
}

/// Trait for acknowledging delivered records.
#[async_trait::async_trait]
pub trait MarkDelivered {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Mark a record delivered.
    ///
    /// Returns `true` when the record transitioned and `false` when it was
    /// already delivered. Unknown ids are an error.
    async fn mark_delivered(&self, id: Uuid) -> Result<bool, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn new_records_are_pending_with_microsecond_timestamps() {
        let now = Utc::now();
        let record = NewOutboxEvent::new("PaymentCreated", "{}").into_record(now);

        assert!(record.is_pending());
        assert_eq!(record.delivered_at, None);
        assert_eq!(record.created_at.nanosecond() % 1_000, 0);
    }

    #[test]
    fn marking_twice_keeps_first_timestamp() {
        let mut record = NewOutboxEvent::new("PaymentCreated", "{}").into_record(Utc::now());
        let first = Utc::now();
        let second = first + chrono::Duration::seconds(5);

        assert!(record.mark_delivered(first));
        assert!(!record.mark_delivered(second));
        assert_eq!(record.delivered_at, Some(first));
        assert!(record.delivered);
    }

    #[test]
    fn json_event_serializes_payload() {
        #[derive(Serialize)]
        struct Created {
            amount: u32,
        }

        let event = NewOutboxEvent::json("PaymentCreated", &Created { amount: 42 })
            .unwrap()
            .with_trace_context("00-abc-def-01", Some("vendor=1".into()));

        assert_eq!(event.event_content, r#"{"amount":42}"#);
        assert_eq!(event.trace_parent.as_deref(), Some("00-abc-def-01"));
        assert_eq!(event.trace_state.as_deref(), Some("vendor=1"));
    }
}
