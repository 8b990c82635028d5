use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::outbox::{FetchPending, InsertRecords, MarkDelivered, OutboxRecord, Transactional};

/// An in-memory outbox for testing or local usage.
///
/// Records are kept in insertion order. Writes made through an
/// [`InMemoryTransaction`] become visible together on commit, or not at all.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    records: Vec<OutboxRecord>,
    failing_commits: usize,
}

/// Staged writes of an in-memory unit of work.
///
/// Besides outbox records, domain code can stage its own writes with
/// [`on_commit`](Self::on_commit); they run under the same commit.
#[derive(Default)]
pub struct InMemoryTransaction {
    records: Vec<OutboxRecord>,
    on_commit: Vec<Box<dyn FnOnce() + Send>>,
}

impl InMemoryTransaction {
    /// Stage a write that runs only if the transaction commits.
    pub fn on_commit(&mut self, write: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(write));
    }

    /// Records staged so far.
    pub fn staged_records(&self) -> &[OutboxRecord] {
        &self.records
    }
}

impl InMemoryOutbox {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail, discarding their writes.
    pub async fn fail_next_commits(&self, n: usize) {
        self.state.lock().await.failing_commits = n;
    }

    /// Snapshot of every stored record, in insertion order.
    pub async fn records(&self) -> Vec<OutboxRecord> {
        self.state.lock().await.records.clone()
    }

    /// Look up a single record.
    pub async fn get(&self, id: Uuid) -> Option<OutboxRecord> {
        self.state
            .lock()
            .await
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }
}

#[async_trait]
impl Transactional for InMemoryOutbox {
    type Error = InMemoryOutboxError;
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(InMemoryTransaction::default())
    }

    /// Apply every staged write while holding the store lock.
    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(InMemoryOutboxError::commit_failed());
        }

        state.records.extend(tx.records);
        for write in tx.on_commit {
            write();
        }
        Ok(())
    }
}

#[async_trait]
impl InsertRecords for InMemoryOutbox {
    async fn insert_records(
        &self,
        records: Vec<OutboxRecord>,
        tx: &mut Self::Transaction,
    ) -> Result<(), Self::Error> {
        tx.records.extend(records);
        Ok(())
    }
}

#[async_trait]
impl FetchPending for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn next_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, Self::Error> {
        let state = self.state.lock().await;
        let mut pending: Vec<_> = state
            .records
            .iter()
            .filter(|r| r.is_pending())
            .cloned()
            .collect();
        // Stable: ties keep insertion order.
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn pending_count(&self) -> Result<u64, Self::Error> {
        let state = self.state.lock().await;
        Ok(state.records.iter().filter(|r| r.is_pending()).count() as u64)
    }
}

#[async_trait]
impl MarkDelivered for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn mark_delivered(&self, id: Uuid) -> Result<bool, Self::Error> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(InMemoryOutboxError::not_found(id))?;
        Ok(record.mark_delivered(Utc::now().trunc_subsecs(6)))
    }
}

/// Error type for `InMemoryOutbox` operations.
#[derive(Debug)]
pub struct InMemoryOutboxError {
    kind: InMemoryOutboxErrorKind,
}

impl InMemoryOutboxError {
    fn not_found(id: Uuid) -> Self {
        Self {
            kind: InMemoryOutboxErrorKind::NotFound(id),
        }
    }

    fn commit_failed() -> Self {
        Self {
            kind: InMemoryOutboxErrorKind::CommitFailed,
        }
    }
}

impl std::fmt::Display for InMemoryOutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryOutboxErrorKind::NotFound(id) => {
                write!(f, "Outbox record {id} not found in in-memory driver")
            }
            InMemoryOutboxErrorKind::CommitFailed => {
                write!(f, "Injected commit failure in in-memory driver")
            }
        }
    }
}

impl std::error::Error for InMemoryOutboxError {}

#[derive(Debug)]
enum InMemoryOutboxErrorKind {
    NotFound(Uuid),
    CommitFailed,
}
