use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use sqlx::{PgPool, Postgres, Row, postgres::PgRow};
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::outbox::{FetchPending, InsertRecords, MarkDelivered, OutboxRecord, Transactional};

macro_rules! outbox_table {
    () => {
        "outbox_records"
    };
}

/// Name of the outbox table. Every statement of this module targets it.
pub const OUTBOX_TABLE: &str = outbox_table!();

/// Transaction type shared by the outbox and domain writes.
pub type PgTransaction = sqlx::Transaction<'static, Postgres>;

/// Postgres outbox store.
///
/// A single store instance is expected per outbox table: `next_batch` takes
/// no row locks, so two relays draining the same table would both publish
/// every record.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    /// Creates a store over a pool without touching the schema.
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a store and ensures the outbox table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Transactional for PgOutboxStore {
    type Error = Error;
    type Transaction = PgTransaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl InsertRecords for PgOutboxStore {
    #[tracing::instrument(skip_all, fields(count = records.len()))]
    async fn insert_records(
        &self,
        records: Vec<OutboxRecord>,
        tx: &mut Self::Transaction,
    ) -> Result<(), Self::Error> {
        for record in records {
            sqlx::query(concat!(
                "INSERT INTO ",
                outbox_table!(),
                " (id, event_name, event_content, trace_parent, trace_state, created_at, delivered, delivered_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            ))
            .bind(record.id)
            .bind(record.event_name)
            .bind(record.event_content)
            .bind(record.trace_parent)
            .bind(record.trace_state)
            .bind(record.created_at)
            .bind(record.delivered)
            .bind(record.delivered_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FetchPending for PgOutboxStore {
    type Error = Error;

    #[tracing::instrument(skip(self))]
    async fn next_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, Self::Error> {
        let mut rows = sqlx::query(concat!(
            "SELECT id, event_name, event_content, trace_parent, trace_state, created_at, delivered, delivered_at \
             FROM ",
            outbox_table!(),
            " WHERE delivered = FALSE ORDER BY created_at, id LIMIT $1",
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(record_from_row(&row)?);
        }
        Ok(out)
    }

    async fn pending_count(&self) -> Result<u64, Self::Error> {
        let count: i64 =
            sqlx::query_scalar(concat!(
                "SELECT COUNT(*) FROM ",
                outbox_table!(),
                " WHERE delivered = FALSE"
            ))
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl MarkDelivered for PgOutboxStore {
    type Error = Error;

    /// Conditional update: a delivered row is never touched again.
    #[tracing::instrument(skip(self))]
    async fn mark_delivered(&self, id: Uuid) -> Result<bool, Self::Error> {
        let row = sqlx::query(concat!(
            "WITH updated AS (UPDATE ",
            outbox_table!(),
            " SET delivered = TRUE, delivered_at = $2 \
                WHERE id = $1 AND delivered = FALSE RETURNING id \
             ) \
             SELECT EXISTS (SELECT 1 FROM updated) AS transitioned, \
                    EXISTS (SELECT 1 FROM ",
            outbox_table!(),
            " WHERE id = $1) AS found",
        ))
        .bind(id)
        .bind(Utc::now().trunc_subsecs(6))
        .fetch_one(&self.pool)
        .await?;

        let transitioned: bool = row.try_get("transitioned")?;
        let found: bool = row.try_get("found")?;
        if !found {
            return Err(Error::not_found(id));
        }
        Ok(transitioned)
    }
}

fn record_from_row(row: &PgRow) -> Result<OutboxRecord, Error> {
    Ok(OutboxRecord {
        id: row.try_get("id")?,
        event_name: row.try_get("event_name")?,
        event_content: row.try_get("event_content")?,
        trace_parent: row.try_get("trace_parent")?,
        trace_state: row.try_get("trace_state")?,
        created_at: row.try_get("created_at")?,
        delivered: row.try_get("delivered")?,
        delivered_at: row.try_get("delivered_at")?,
    })
}

/// Ensures the outbox table and its pending index exist.
pub async fn create_table(pool: &PgPool) -> Result<(), Error> {
    sqlx::query(concat!(
        "CREATE TABLE IF NOT EXISTS ",
        outbox_table!(),
        " (
            id UUID PRIMARY KEY,
            event_name TEXT NOT NULL,
            event_content TEXT NOT NULL,
            trace_parent TEXT,
            trace_state TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            delivered BOOLEAN NOT NULL DEFAULT FALSE,
            delivered_at TIMESTAMPTZ
        )",
    ))
    .execute(pool)
    .await?;

    sqlx::query(concat!(
        "CREATE INDEX IF NOT EXISTS ",
        outbox_table!(),
        "_pending_idx ON ",
        outbox_table!(),
        " (created_at, id) WHERE delivered = FALSE",
    ))
    .execute(pool)
    .await?;
    Ok(())
}

/// Postgres outbox errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: PgOutboxErrorKind,
}

/// Kinds of Postgres outbox errors.
#[derive(Debug)]
pub enum PgOutboxErrorKind {
    Database(sqlx::Error),
    NotFound(Uuid),
}

impl Error {
    fn not_found(id: Uuid) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgOutboxErrorKind::NotFound(id),
        }
    }

    /// The error classification.
    pub fn kind(&self) -> &PgOutboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PgOutboxErrorKind::Database(err) => writeln!(f, "Database error: {err}"),
            PgOutboxErrorKind::NotFound(id) => writeln!(f, "Outbox record {id} not found"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PgOutboxErrorKind::Database(err) => Some(err),
            PgOutboxErrorKind::NotFound(_) => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgOutboxErrorKind::Database(err),
        }
    }
}
