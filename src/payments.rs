//! Payment domain wired to the outbox.
//!
//! A [`PaymentCommandHandler`] stores a new [`Payment`] and the matching
//! `PaymentCreated` outbox record in one transaction, so the payment never
//! exists without its announcement.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    outbox::{InsertRecords, NewOutboxEvent, OutboxError, inmemory::InMemoryTransaction},
    writer::{DomainChange, TransactionalWriter},
};

/// Event name of [`PaymentCreatedEvent`].
pub const PAYMENT_CREATED: &str = "PaymentCreated";
/// Topic payment events are published to.
pub const PAYMENTS_TOPIC: &str = "payments";

/// Invalid payment data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    EmptyPaymentId,
    EmptyMerchantId,
    InvalidAmount(i64),
    InvalidCurrency(String),
    AlreadyExists(Uuid),
}

impl fmt::Display for PaymentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentError::EmptyPaymentId => write!(f, "Payment id must not be empty"),
            PaymentError::EmptyMerchantId => write!(f, "Merchant id must not be empty"),
            PaymentError::InvalidAmount(amount) => {
                write!(f, "Amount must be positive, got {amount} minor units")
            }
            PaymentError::InvalidCurrency(currency) => {
                write!(f, "Currency must be a 3-letter upper-case code, got {currency:?}")
            }
            PaymentError::AlreadyExists(id) => write!(f, "Payment {id} already exists"),
        }
    }
}

impl std::error::Error for PaymentError {}

/// A positive amount in minor units (cents) of an ISO 4217 currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount_minor: i64,
    currency: String,
}

impl Money {
    pub fn new(amount_minor: i64, currency: impl Into<String>) -> Result<Self, PaymentError> {
        if amount_minor <= 0 {
            return Err(PaymentError::InvalidAmount(amount_minor));
        }
        let currency = currency.into();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(PaymentError::InvalidCurrency(currency));
        }
        Ok(Self {
            amount_minor,
            currency,
        })
    }

    pub fn amount_minor(&self) -> i64 {
        self.amount_minor
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02} {}",
            self.amount_minor / 100,
            self.amount_minor % 100,
            self.currency
        )
    }
}

/// Payment aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    id: Uuid,
    merchant_id: Uuid,
    amount: Money,
    created_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(id: Uuid, merchant_id: Uuid, amount: Money) -> Result<Self, PaymentError> {
        if id.is_nil() {
            return Err(PaymentError::EmptyPaymentId);
        }
        if merchant_id.is_nil() {
            return Err(PaymentError::EmptyMerchantId);
        }
        Ok(Self {
            id,
            merchant_id,
            amount,
            created_at: Utc::now().trunc_subsecs(6),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn merchant_id(&self) -> Uuid {
        self.merchant_id
    }

    pub fn amount(&self) -> &Money {
        &self.amount
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The integration event announcing this payment.
    pub fn created_event(&self) -> PaymentCreatedEvent {
        PaymentCreatedEvent {
            payment_id: self.id,
            merchant_id: self.merchant_id,
            amount_minor: self.amount.amount_minor,
            currency: self.amount.currency.clone(),
            created_at_utc: self.created_at,
        }
    }
}

/// Wire contract of the `PaymentCreated` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCreatedEvent {
    pub payment_id: Uuid,
    pub merchant_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub created_at_utc: DateTime<Utc>,
}

/// In-memory payment table.
///
/// Writes are staged on an [`InMemoryTransaction`] and land together with the
/// outbox records of the same transaction.
#[derive(Clone, Default)]
pub struct InMemoryPayments {
    payments: Arc<Mutex<HashMap<Uuid, Payment>>>,
}

impl InMemoryPayments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<Payment> {
        self.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Payment>> {
        self.payments.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Domain change inserting one payment into repository `R`.
#[derive(Debug, Clone)]
pub struct CreatePayment<R> {
    payment: Payment,
    repository: R,
}

impl<R> CreatePayment<R> {
    pub fn new(payment: Payment, repository: R) -> Self {
        Self {
            payment,
            repository,
        }
    }
}

#[async_trait::async_trait]
impl DomainChange<InMemoryTransaction> for CreatePayment<InMemoryPayments> {
    async fn apply(&self, tx: &mut InMemoryTransaction) -> Result<(), tower::BoxError> {
        if self.repository.lock().contains_key(&self.payment.id) {
            return Err(Box::new(PaymentError::AlreadyExists(self.payment.id)));
        }

        let payments = self.repository.clone();
        let payment = self.payment.clone();
        tx.on_commit(move || {
            payments.lock().insert(payment.id, payment);
        });
        Ok(())
    }
}

#[cfg(feature = "sqlx")]
pub use pg::PgPayments;

#[cfg(feature = "sqlx")]
mod pg {
    use sqlx::{PgPool, Row};
    use uuid::Uuid;

    use super::{CreatePayment, Money, Payment};
    use crate::{outbox::sqlx::PgTransaction, writer::DomainChange};

    /// Postgres payment table.
    #[derive(Clone)]
    pub struct PgPayments {
        pool: PgPool,
    }

    impl PgPayments {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        /// Ensures the payments table exists.
        pub async fn create_table(&self) -> Result<(), sqlx::Error> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS payments (
                    id UUID PRIMARY KEY,
                    merchant_id UUID NOT NULL,
                    amount_minor BIGINT NOT NULL,
                    currency TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        pub async fn get(&self, id: Uuid) -> Result<Option<Payment>, sqlx::Error> {
            let row = sqlx::query(
                "SELECT id, merchant_id, amount_minor, currency, created_at FROM payments WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

            row.map(|row| -> Result<Payment, sqlx::Error> {
                Ok(Payment {
                    id: row.try_get("id")?,
                    merchant_id: row.try_get("merchant_id")?,
                    amount: Money {
                        amount_minor: row.try_get("amount_minor")?,
                        currency: row.try_get("currency")?,
                    },
                    created_at: row.try_get("created_at")?,
                })
            })
            .transpose()
        }
    }

    #[async_trait::async_trait]
    impl DomainChange<PgTransaction> for CreatePayment<PgPayments> {
        async fn apply(&self, tx: &mut PgTransaction) -> Result<(), tower::BoxError> {
            sqlx::query(
                "INSERT INTO payments (id, merchant_id, amount_minor, currency, created_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(self.payment.id)
            .bind(self.payment.merchant_id)
            .bind(self.payment.amount.amount_minor)
            .bind(self.payment.amount.currency.as_str())
            .bind(self.payment.created_at)
            .execute(&mut **tx)
            .await?;
            Ok(())
        }
    }
}

/// Creates payments and announces them through the outbox.
#[derive(Clone)]
pub struct PaymentCommandHandler<D, R> {
    writer: TransactionalWriter<D>,
    repository: R,
}

impl<D, R> PaymentCommandHandler<D, R>
where
    D: InsertRecords + Send + Sync,
    R: Clone,
    CreatePayment<R>: DomainChange<D::Transaction>,
{
    pub fn new(writer: TransactionalWriter<D>, repository: R) -> Self {
        Self { writer, repository }
    }

    /// Store `payment` and its `PaymentCreated` record atomically.
    ///
    /// Returns the outbox record id.
    #[tracing::instrument(skip_all, fields(payment_id = %payment.id(), merchant_id = %payment.merchant_id()))]
    pub async fn handle(&self, payment: Payment) -> Result<Uuid, OutboxError> {
        let event = NewOutboxEvent::json(PAYMENT_CREATED, &payment.created_event())?;
        let change = CreatePayment::new(payment, self.repository.clone());
        let record_id = self.writer.persist(&change, event).await?;
        tracing::info!(%record_id, amount = %change.payment.amount, "Payment stored");
        Ok(record_id)
    }
}
