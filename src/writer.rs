//! Atomic write of a domain change together with its announcements.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    outbox::{InsertRecords, NewOutboxEvent, OutboxError, OutboxRecord},
    router::TopicRouter,
};

/// A business state change applied inside an outbox transaction.
///
/// `Tx` is the transaction type of the outbox backend, so the change and the
/// outbox rows commit or roll back together.
#[async_trait::async_trait]
pub trait DomainChange<Tx: Send>: Send + Sync {
    /// Apply the change.
    ///
    /// Returning an error aborts the whole unit of work.
    async fn apply(&self, tx: &mut Tx) -> Result<(), tower::BoxError>;
}

/// The empty change: only outbox rows are written.
#[async_trait::async_trait]
impl<Tx: Send> DomainChange<Tx> for () {
    async fn apply(&self, _tx: &mut Tx) -> Result<(), tower::BoxError> {
        Ok(())
    }
}

/// Persists domain changes and outbox records in one transaction.
///
/// Every event name is checked against the [`TopicRouter`] before anything is
/// written, so an unroutable event never reaches the outbox.
#[derive(Clone)]
pub struct TransactionalWriter<D> {
    store: D,
    router: TopicRouter,
    wake: Option<Arc<Notify>>,
}

impl<D> TransactionalWriter<D>
where
    D: InsertRecords + Send + Sync,
{
    pub fn new(store: D, router: TopicRouter) -> Self {
        Self {
            store,
            router,
            wake: None,
        }
    }

    /// Signal `wake` after every successful commit.
    ///
    /// Sharing it with [`OutboxRelay::with_wake`](crate::OutboxRelay::with_wake)
    /// lets an idle relay pick new records up without waiting for its next
    /// poll.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn store(&self) -> &D {
        &self.store
    }

    /// Apply `change` and append `event` atomically.
    ///
    /// Returns the id of the stored record.
    pub async fn persist<C>(&self, change: &C, event: NewOutboxEvent) -> Result<Uuid, OutboxError>
    where
        C: DomainChange<D::Transaction> + ?Sized,
    {
        let ids = self.persist_many(change, vec![event]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| OutboxError::backend("no record was written"))
    }

    /// Apply `change` and append every event atomically, in order.
    #[tracing::instrument(skip_all, fields(events = events.len()))]
    pub async fn persist_many<C>(
        &self,
        change: &C,
        events: Vec<NewOutboxEvent>,
    ) -> Result<Vec<Uuid>, OutboxError>
    where
        C: DomainChange<D::Transaction> + ?Sized,
    {
        let records = self.prepare(events)?;
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();

        let mut tx = self.store.begin().await.map_err(OutboxError::backend)?;
        change.apply(&mut tx).await.map_err(OutboxError::domain)?;
        self.store
            .insert_records(records, &mut tx)
            .await
            .map_err(OutboxError::backend)?;
        self.store.commit(tx).await.map_err(OutboxError::backend)?;

        tracing::debug!(?ids, "Outbox records committed");
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
        Ok(ids)
    }

    /// Append events to a transaction owned by the caller.
    ///
    /// Nothing becomes visible until the caller commits `tx`. The wake signal
    /// is not sent; call [`notify_committed`](Self::notify_committed) after
    /// committing.
    pub async fn append(
        &self,
        events: Vec<NewOutboxEvent>,
        tx: &mut D::Transaction,
    ) -> Result<Vec<Uuid>, OutboxError> {
        let records = self.prepare(events)?;
        let ids = records.iter().map(|r| r.id).collect();
        self.store
            .insert_records(records, tx)
            .await
            .map_err(OutboxError::backend)?;
        Ok(ids)
    }

    /// Signal the relay that new records were committed.
    pub fn notify_committed(&self) {
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
    }

    fn prepare(&self, events: Vec<NewOutboxEvent>) -> Result<Vec<OutboxRecord>, OutboxError> {
        let now = Utc::now();
        events
            .into_iter()
            .map(|event| {
                self.router
                    .resolve(&event.event_name)
                    .map_err(OutboxError::unroutable)?;
                Ok(event.into_record(now))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{
        FetchPending, OutboxErrorKind, Transactional,
        inmemory::{InMemoryOutbox, InMemoryTransaction},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl DomainChange<InMemoryTransaction> for Counter {
        async fn apply(&self, tx: &mut InMemoryTransaction) -> Result<(), tower::BoxError> {
            let counter = Arc::clone(&self.0);
            tx.on_commit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            Ok(())
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl DomainChange<InMemoryTransaction> for Failing {
        async fn apply(&self, _tx: &mut InMemoryTransaction) -> Result<(), tower::BoxError> {
            Err("insufficient funds".into())
        }
    }

    fn writer(outbox: &InMemoryOutbox) -> TransactionalWriter<InMemoryOutbox> {
        let router = TopicRouter::new().route("PaymentCreated", "payments");
        TransactionalWriter::new(outbox.clone(), router)
    }

    #[tokio::test]
    async fn persist_commits_change_and_record_together() {
        let outbox = InMemoryOutbox::new();
        let applied = Arc::new(AtomicUsize::new(0));

        let id = writer(&outbox)
            .persist(
                &Counter(Arc::clone(&applied)),
                NewOutboxEvent::new("PaymentCreated", "{}"),
            )
            .await
            .unwrap();

        assert_eq!(applied.load(Ordering::SeqCst), 1);
        let stored = outbox.get(id).await.unwrap();
        assert!(stored.is_pending());
        assert_eq!(stored.event_name, "PaymentCreated");
    }

    #[tokio::test]
    async fn failed_commit_leaves_nothing_behind() {
        let outbox = InMemoryOutbox::new();
        outbox.fail_next_commits(1).await;
        let applied = Arc::new(AtomicUsize::new(0));

        let err = writer(&outbox)
            .persist(
                &Counter(Arc::clone(&applied)),
                NewOutboxEvent::new("PaymentCreated", "{}"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), OutboxErrorKind::Backend(_)));
        assert_eq!(applied.load(Ordering::SeqCst), 0);
        assert!(outbox.records().await.is_empty());
    }

    #[tokio::test]
    async fn failed_domain_change_writes_no_record() {
        let outbox = InMemoryOutbox::new();

        let err = writer(&outbox)
            .persist(&Failing, NewOutboxEvent::new("PaymentCreated", "{}"))
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), OutboxErrorKind::Domain(_)));
        assert!(outbox.records().await.is_empty());
    }

    #[tokio::test]
    async fn unroutable_event_is_rejected_before_writing() {
        let outbox = InMemoryOutbox::new();
        let applied = Arc::new(AtomicUsize::new(0));

        let err = writer(&outbox)
            .persist_many(
                &Counter(Arc::clone(&applied)),
                vec![
                    NewOutboxEvent::new("PaymentCreated", "{}"),
                    NewOutboxEvent::new("RefundIssued", "{}"),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), OutboxErrorKind::Unroutable(_)));
        assert_eq!(applied.load(Ordering::SeqCst), 0);
        assert_eq!(outbox.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn persist_many_keeps_event_order() {
        let outbox = InMemoryOutbox::new();

        let ids = writer(&outbox)
            .persist_many(
                &(),
                vec![
                    NewOutboxEvent::new("PaymentCreated", r#"{"n":1}"#),
                    NewOutboxEvent::new("PaymentCreated", r#"{"n":2}"#),
                ],
            )
            .await
            .unwrap();

        let batch = outbox.next_batch(10).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.id).collect::<Vec<_>>(), ids);
    }

    #[tokio::test]
    async fn commit_wakes_the_relay() {
        let outbox = InMemoryOutbox::new();
        let wake = Arc::new(Notify::new());
        let writer = writer(&outbox).with_wake(Arc::clone(&wake));

        writer
            .persist(&(), NewOutboxEvent::new("PaymentCreated", "{}"))
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), wake.notified())
            .await
            .expect("wake signal was not sent");
    }

    #[tokio::test]
    async fn append_is_invisible_until_caller_commits() {
        let outbox = InMemoryOutbox::new();
        let writer = writer(&outbox);

        let mut tx = writer.store().begin().await.unwrap();
        writer
            .append(vec![NewOutboxEvent::new("PaymentCreated", "{}")], &mut tx)
            .await
            .unwrap();
        assert!(outbox.records().await.is_empty());

        writer.store().commit(tx).await.unwrap();
        assert_eq!(outbox.records().await.len(), 1);
    }
}
