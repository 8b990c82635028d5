//! Relay loop forwarding outbox records to the broker.
//!
//! The relay repeatedly:
//!
//! - Fetches the oldest undelivered records from the outbox
//! - Resolves each record's destination through the [`TopicRouter`]
//! - Sends it through a [`Transport`] and waits for the acknowledgement
//! - Marks it delivered
//!
//! Records are processed strictly in order. The first record that cannot be
//! delivered ends the batch: later records are not attempted until it goes
//! through, and the relay backs off before starting over from it.
//!
//! Delivery is *at-least-once*. A failure between the broker acknowledgement
//! and `mark_delivered` sends the record again on the next cycle.
//!
//! The relay runs until a [`CancellationToken`] is triggered or, when a
//! threshold is configured, until too many consecutive cycles failed.

pub mod backoff;

use std::{sync::Arc, time::Duration};

use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tower::Service;
use uuid::Uuid;

use crate::{
    outbox::{FetchPending, MarkDelivered, OutboxRecord},
    router::TopicRouter,
    transport::{BrokerMessage, Transport, TransportError},
};

pub use backoff::Backoff;

/// Relay tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Maximum number of records fetched per cycle. Zero is treated as one.
    pub batch_size: usize,
    /// Sleep between polls of an empty outbox.
    pub poll_interval: Duration,
    /// Delay policy after a failed cycle.
    pub backoff: Backoff,
    /// Consecutive failed cycles after which `run` gives up.
    ///
    /// `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(2),
            backoff: Backoff::default(),
            max_consecutive_failures: None,
        }
    }
}

impl RelayConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = Some(failures.max(1));
        self
    }
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The broker acknowledged the message.
    Delivered,
    /// The attempt failed but may succeed later.
    Transient(String),
    /// The record cannot be delivered as it is.
    Fatal(String),
}

impl DeliveryOutcome {
    fn from_send(result: Result<(), TransportError>) -> Self {
        match result {
            Ok(()) => Self::Delivered,
            Err(err) if err.is_permanent() => Self::Fatal(reason(&err)),
            Err(err) => Self::Transient(reason(&err)),
        }
    }
}

fn reason(err: &TransportError) -> String {
    std::error::Error::source(err)
        .map(ToString::to_string)
        .unwrap_or_else(|| err.to_string())
}

/// Observable relay state, published through a `watch` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    /// `run` has not started yet.
    Starting,
    /// No pending records; waiting for the next poll.
    Idle,
    /// Publishing a batch.
    Draining,
    /// Waiting after a transient failure.
    BackingOff {
        /// The record that failed, `None` when the store itself failed.
        record_id: Option<Uuid>,
        /// Consecutive failed cycles so far.
        attempt: u32,
    },
    /// A record cannot be delivered. It stays pending and blocks the records
    /// behind it until an operator intervenes.
    Stalled { record_id: Uuid, reason: String },
    /// `run` returned.
    Stopped,
}

/// Outbox relay.
///
/// Generic parameters:
/// - `D`: Outbox store
/// - `HK`: Hook implementation for lifecycle events
/// - `T`: Transport service type
pub struct OutboxRelay<D, HK, T> {
    store: D,
    router: TopicRouter,
    transport: Transport<T>,
    hook: HK,
    config: RelayConfig,
    status: watch::Sender<RelayStatus>,
    wake: Option<Arc<Notify>>,
}

impl<D, T> OutboxRelay<D, DefaultRelayHook, T> {
    /// Create a new relay with the default hook and configuration.
    pub fn new(store: D, router: TopicRouter, transport: Transport<T>) -> Self {
        let (status, _) = watch::channel(RelayStatus::Starting);
        Self {
            store,
            router,
            transport,
            hook: DefaultRelayHook,
            config: RelayConfig::default(),
            status,
            wake: None,
        }
    }
}

enum Cycle {
    Idle,
    Drained,
    Cancelled,
    Failed(Failure),
}

enum Failure {
    Store(String),
    Transient { record_id: Uuid, reason: String },
    Fatal { record_id: Uuid, reason: String },
}

impl Failure {
    fn reason(&self) -> &str {
        match self {
            Failure::Store(reason)
            | Failure::Transient { reason, .. }
            | Failure::Fatal { reason, .. } => reason,
        }
    }
}

impl<D, HK, T> OutboxRelay<D, HK, T>
where
    D: FetchPending + MarkDelivered + Send + Sync,
    HK: RelayHook,
    T: Service<BrokerMessage> + Clone + Send + 'static,
    T::Future: Send + 'static,
    T::Error: Into<tower::BoxError>,
{
    /// Replace the relay hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: RelayHook>(self, hook: HK2) -> OutboxRelay<D, HK2, T> {
        OutboxRelay {
            store: self.store,
            router: self.router,
            transport: self.transport,
            hook,
            config: self.config,
            status: self.status,
            wake: self.wake,
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Cut the idle sleep short whenever `wake` is notified.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Subscribe to status changes.
    pub fn status(&self) -> watch::Receiver<RelayStatus> {
        self.status.subscribe()
    }

    /// Run the relay loop.
    ///
    /// Returns `Ok(())` once `cancel` is triggered. Cancellation is observed
    /// between records and during sleeps, never while a send or a
    /// `mark_delivered` is in flight.
    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), RelayRunError> {
        self.hook.on_startup();
        let result = self.run_loop(&cancel).await;
        self.status.send_replace(RelayStatus::Stopped);
        self.hook.on_shutdown();
        result
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> Result<(), RelayRunError> {
        let mut failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let delay = match self.cycle(cancel).await {
                Cycle::Cancelled => return Ok(()),
                Cycle::Drained => {
                    failures = 0;
                    continue;
                }
                Cycle::Idle => {
                    failures = 0;
                    self.status.send_replace(RelayStatus::Idle);
                    if idle(self.config.poll_interval, self.wake.clone(), cancel).await {
                        return Ok(());
                    }
                    continue;
                }
                Cycle::Failed(failure) => {
                    failures = failures.saturating_add(1);
                    if let Some(max) = self.config.max_consecutive_failures {
                        if failures >= max {
                            self.hook.on_failure_threshold_exceeded(failures);
                            return Err(RelayRunError::threshold(failures, failure.reason()));
                        }
                    }
                    self.on_failure(failure, failures)
                }
            };

            self.hook.on_backoff(failures, delay);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Publish the failure and pick the delay before the next cycle.
    fn on_failure(&self, failure: Failure, attempt: u32) -> Duration {
        match failure {
            Failure::Store(_) => {
                self.status.send_replace(RelayStatus::BackingOff {
                    record_id: None,
                    attempt,
                });
                self.config.backoff.delay_for_attempt(attempt)
            }
            Failure::Transient { record_id, .. } => {
                self.status.send_replace(RelayStatus::BackingOff {
                    record_id: Some(record_id),
                    attempt,
                });
                self.config.backoff.delay_for_attempt(attempt)
            }
            Failure::Fatal { record_id, reason } => {
                self.status
                    .send_replace(RelayStatus::Stalled { record_id, reason });
                self.config.backoff.max_delay
            }
        }
    }


    async fn cycle(&mut self, cancel: &CancellationToken) -> Cycle {
        let batch = match self.store.next_batch(self.config.batch_size.max(1)).await {
            Ok(batch) => batch,
            Err(err) => {
                let err: tower::BoxError = err.into();
                self.hook.on_store_error(err.as_ref());
                return Cycle::Failed(Failure::Store(err.to_string()));
            }
        };

        if batch.is_empty() {
            return Cycle::Idle;
        }

        self.hook.on_batch_fetched(batch.len());
        self.status.send_replace(RelayStatus::Draining);

        for record in &batch {
            if cancel.is_cancelled() {
                return Cycle::Cancelled;
            }

            match self.deliver(record).await {
                DeliveryOutcome::Delivered => {
                    if let Err(err) = self.store.mark_delivered(record.id).await {
                        let err: tower::BoxError = err.into();
                        self.hook.on_mark_delivered_error(record, err.as_ref());
                        return Cycle::Failed(Failure::Transient {
                            record_id: record.id,
                            reason: err.to_string(),
                        });
                    }
                    self.hook.on_record_delivered(record);
                }
                DeliveryOutcome::Transient(reason) => {
                    self.hook.on_record_transient_failure(record, &reason);
                    return Cycle::Failed(Failure::Transient {
                        record_id: record.id,
                        reason,
                    });
                }
                DeliveryOutcome::Fatal(reason) => {
                    self.hook.on_record_fatal(record, &reason);
                    return Cycle::Failed(Failure::Fatal {
                        record_id: record.id,
                        reason,
                    });
                }
            }
        }

        Cycle::Drained
    }

    /// Make a single delivery attempt for `record`.
    #[tracing::instrument(skip_all, fields(record_id = %record.id, event_name = %record.event_name))]
    pub async fn deliver(&mut self, record: &OutboxRecord) -> DeliveryOutcome {
        let destination = match self.router.resolve(&record.event_name) {
            Ok(destination) => destination.to_owned(),
            Err(err) => return DeliveryOutcome::Fatal(err.to_string()),
        };

        let message = BrokerMessage::from_record(record, destination);
        DeliveryOutcome::from_send(self.transport.send(message).await)
    }
}

/// Sleep until the next poll. Returns `true` when cancelled.
///
/// Does not borrow the relay: a shared borrow held across the await would
/// require the transport to be `Sync`.
async fn idle(
    poll_interval: Duration,
    wake: Option<Arc<Notify>>,
    cancel: &CancellationToken,
) -> bool {
    let woken = async move {
        match wake {
            Some(wake) => wake.notified().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(poll_interval) => false,
        _ = woken => false,
    }
}

/// Error returned when the relay loop gives up.
#[derive(Debug)]
pub struct RelayRunError {
    context: tracing_error::SpanTrace,
    kind: RelayRunErrorKind,
}

/// Classification of relay runtime errors.
#[derive(Debug)]
pub enum RelayRunErrorKind {
    /// The configured number of consecutive failed cycles was reached.
    FailureThresholdExceeded { failures: u32, last_error: String },
}

impl RelayRunError {
    fn threshold(failures: u32, last_error: &str) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: RelayRunErrorKind::FailureThresholdExceeded {
                failures,
                last_error: last_error.to_owned(),
            },
        }
    }

    pub fn kind(&self) -> &RelayRunErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for RelayRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RelayRunErrorKind::FailureThresholdExceeded {
                failures,
                last_error,
            } => writeln!(
                f,
                "Relay gave up after {failures} consecutive failures, last error: {last_error}"
            ),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RelayRunError {}

/// Hook trait for observing relay lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and alerting on stalled
/// records.
pub trait RelayHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_batch_fetched(&self, size: usize);
    fn on_record_delivered(&self, record: &OutboxRecord);
    fn on_record_transient_failure(&self, record: &OutboxRecord, reason: &str);
    fn on_record_fatal(&self, record: &OutboxRecord, reason: &str);
    fn on_mark_delivered_error(&self, record: &OutboxRecord, error: &dyn std::error::Error);
    fn on_store_error(&self, error: &dyn std::error::Error);
    fn on_backoff(&self, attempt: u32, delay: Duration);
    fn on_failure_threshold_exceeded(&self, failures: u32);
}

/// Default relay hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultRelayHook;

impl RelayHook for DefaultRelayHook {
    fn on_startup(&self) {
        tracing::info!("Outbox relay is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Outbox relay is shutting down");
    }

    fn on_batch_fetched(&self, size: usize) {
        tracing::debug!(size, "Fetched pending records");
    }

    fn on_record_delivered(&self, record: &OutboxRecord) {
        tracing::info!(record_id = %record.id, event_name = %record.event_name, "Record delivered");
    }

    fn on_record_transient_failure(&self, record: &OutboxRecord, reason: &str) {
        tracing::warn!(record_id = %record.id, event_name = %record.event_name, reason, "Delivery failed, will retry");
    }

    fn on_record_fatal(&self, record: &OutboxRecord, reason: &str) {
        tracing::error!(record_id = %record.id, event_name = %record.event_name, reason, "Record cannot be delivered, relay is stalled");
    }

    fn on_mark_delivered_error(&self, record: &OutboxRecord, error: &dyn std::error::Error) {
        tracing::error!(record_id = %record.id, ?error, "Failed to mark record delivered, it will be sent again");
    }

    fn on_store_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error fetching pending records");
    }

    fn on_backoff(&self, attempt: u32, delay: Duration) {
        tracing::debug!(attempt, ?delay, "Backing off");
    }

    fn on_failure_threshold_exceeded(&self, failures: u32) {
        tracing::error!(failures, "Too many consecutive failures, relay is giving up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        outbox::{
            InsertRecords, NewOutboxEvent, Transactional,
            inmemory::{InMemoryOutbox, InMemoryOutboxError},
        },
        transport::{InMemory, SenderService},
        writer::TransactionalWriter,
    };
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinHandle;
    use tower::util::BoxCloneService;

    type TestRelay<D> = OutboxRelay<D, DefaultRelayHook, SenderService<InMemory>>;

    fn router() -> TopicRouter {
        TopicRouter::new().route("PaymentCreated", "payments")
    }

    fn fast_config() -> RelayConfig {
        RelayConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_backoff(Backoff::fixed(Duration::from_millis(10)))
    }

    fn relay<D>(store: D, broker: &InMemory) -> TestRelay<D>
    where
        D: FetchPending + MarkDelivered + Send + Sync,
    {
        OutboxRelay::new(store, router(), Transport::new(broker.clone())).with_config(fast_config())
    }

    fn spawn<D>(relay: TestRelay<D>) -> (CancellationToken, JoinHandle<Result<(), RelayRunError>>)
    where
        D: FetchPending + MarkDelivered + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(relay.run(cancel.clone()));
        (cancel, handle)
    }

    async fn persist(outbox: &InMemoryOutbox, count: usize) -> Vec<Uuid> {
        let events = (0..count)
            .map(|n| NewOutboxEvent::new("PaymentCreated", format!(r#"{{"n":{n}}}"#)))
            .collect();
        TransactionalWriter::new(outbox.clone(), router())
            .persist_many(&(), events)
            .await
            .unwrap()
    }

    /// Insert records without going through the router check.
    async fn insert_raw(outbox: &InMemoryOutbox, names: &[&str]) -> Vec<Uuid> {
        let records: Vec<_> = names
            .iter()
            .map(|n| NewOutboxEvent::new(*n, "{}").into_record(Utc::now()))
            .collect();
        let ids = records.iter().map(|r| r.id).collect();
        let mut tx = outbox.begin().await.unwrap();
        outbox.insert_records(records, &mut tx).await.unwrap();
        outbox.commit(tx).await.unwrap();
        ids
    }

    async fn wait_until_drained(outbox: &InMemoryOutbox) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while outbox.pending_count().await.unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("outbox was not drained");
    }

    fn sent_ids(sent: &[BrokerMessage]) -> Vec<String> {
        sent.iter().map(|m| m.message_id.clone()).collect()
    }

    fn to_strings(ids: &[Uuid]) -> Vec<String> {
        ids.iter().map(Uuid::to_string).collect()
    }

    #[tokio::test]
    async fn delivered_record_is_marked_and_not_fetched_again() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemory::new();
        let ids = persist(&outbox, 1).await;

        let (cancel, handle) = spawn(relay(outbox.clone(), &broker));
        wait_until_drained(&outbox).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let record = outbox.get(ids[0]).await.unwrap();
        assert!(record.delivered);
        assert!(record.delivered_at.is_some());
        assert!(outbox.next_batch(10).await.unwrap().is_empty());

        let sent = broker.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, "payments");
        assert_eq!(sent[0].subject, "PaymentCreated");
        assert_eq!(sent[0].message_id, ids[0].to_string());
    }

    #[tokio::test]
    async fn failed_record_is_retried_before_later_records() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemory::new();
        let ids = persist(&outbox, 3).await;
        broker.fail_message(ids[1].to_string(), 1).await;

        let (cancel, handle) = spawn(relay(outbox.clone(), &broker));
        wait_until_drained(&outbox).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let expected_attempts = to_strings(&[ids[0], ids[1], ids[1], ids[2]]);
        assert_eq!(broker.attempts().await, expected_attempts);
        assert_eq!(sent_ids(&broker.sent_messages().await), to_strings(&ids));
    }

    #[tokio::test]
    async fn records_reach_the_broker_in_creation_order() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemory::new();
        let ids = persist(&outbox, 25).await;

        let relay = relay(outbox.clone(), &broker)
            .with_config(fast_config().with_batch_size(4));
        let (cancel, handle) = spawn(relay);
        wait_until_drained(&outbox).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(sent_ids(&broker.sent_messages().await), to_strings(&ids));
    }

    #[tokio::test]
    async fn unroutable_record_stalls_without_crashing() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemory::new();
        let ids = insert_raw(&outbox, &["RefundIssued", "PaymentCreated"]).await;

        let relay = relay(outbox.clone(), &broker);
        let mut status = relay.status();
        let (cancel, handle) = spawn(relay);

        let stalled = tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| matches!(s, RelayStatus::Stalled { .. })),
        )
        .await
        .expect("relay did not stall")
        .unwrap()
        .clone();

        assert!(matches!(stalled, RelayStatus::Stalled { record_id, .. } if record_id == ids[0]));
        assert!(!handle.is_finished());
        assert!(broker.attempts().await.is_empty());
        assert_eq!(outbox.pending_count().await.unwrap(), 2);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(*status.borrow(), RelayStatus::Stopped);
    }

    #[tokio::test]
    async fn rejected_message_is_fatal() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemory::new();
        broker.reject_destination("payments").await;
        let ids = persist(&outbox, 1).await;

        let relay = relay(outbox.clone(), &broker);
        let mut status = relay.status();
        let (cancel, handle) = spawn(relay);

        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| matches!(s, RelayStatus::Stalled { record_id, .. } if *record_id == ids[0])),
        )
        .await
        .expect("relay did not stall")
        .unwrap();

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(outbox.get(ids[0]).await.unwrap().is_pending());
    }

    /// Store whose first `mark_delivered` calls fail after the broker acked.
    #[derive(Clone)]
    struct LosesAcks {
        inner: InMemoryOutbox,
        failures: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl FetchPending for LosesAcks {
        type Error = InMemoryOutboxError;

        async fn next_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, Self::Error> {
            self.inner.next_batch(limit).await
        }

        async fn pending_count(&self) -> Result<u64, Self::Error> {
            self.inner.pending_count().await
        }
    }

    #[async_trait::async_trait]
    impl MarkDelivered for LosesAcks {
        type Error = tower::BoxError;

        async fn mark_delivered(&self, id: Uuid) -> Result<bool, Self::Error> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err("connection lost before commit".into());
            }
            Ok(self.inner.mark_delivered(id).await?)
        }
    }

    #[tokio::test]
    async fn lost_mark_delivered_causes_redelivery() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemory::new();
        let ids = persist(&outbox, 1).await;
        let store = LosesAcks {
            inner: outbox.clone(),
            failures: Arc::new(AtomicUsize::new(1)),
        };

        let (cancel, handle) = spawn(relay(store, &broker));
        wait_until_drained(&outbox).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let sent = broker.sent_messages().await;
        assert_eq!(sent_ids(&sent), to_strings(&[ids[0], ids[0]]));
        assert!(outbox.get(ids[0]).await.unwrap().delivered);
    }

    #[tokio::test]
    async fn relay_over_boxed_service_can_be_spawned() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemory::new();
        let ids = persist(&outbox, 2).await;

        let transport =
            Transport::from_service(BoxCloneService::new(SenderService::new(broker.clone())));
        let relay = OutboxRelay::new(outbox.clone(), router(), transport).with_config(fast_config());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(relay.run(cancel.clone()));

        wait_until_drained(&outbox).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(sent_ids(&broker.sent_messages().await), to_strings(&ids));
    }

    #[tokio::test]
    async fn zero_batch_size_still_drains() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemory::new();
        persist(&outbox, 2).await;

        let mut config = fast_config();
        config.batch_size = 0;
        let (cancel, handle) = spawn(relay(outbox.clone(), &broker).with_config(config));
        wait_until_drained(&outbox).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.sent_messages().await.len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_failure_threshold() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemory::new();
        broker.fail_next(usize::MAX).await;
        persist(&outbox, 1).await;

        let relay = relay(outbox.clone(), &broker)
            .with_config(fast_config().with_max_consecutive_failures(3));
        let err = tokio::time::timeout(Duration::from_secs(5), relay.run(CancellationToken::new()))
            .await
            .expect("relay did not give up")
            .unwrap_err();

        assert!(matches!(
            err.kind(),
            RelayRunErrorKind::FailureThresholdExceeded { failures: 3, .. }
        ));
        assert_eq!(broker.attempts().await.len(), 3);
        assert_eq!(outbox.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_relay() {
        let broker = InMemory::new();
        let relay = relay(InMemoryOutbox::new(), &broker)
            .with_config(fast_config().with_poll_interval(Duration::from_secs(3600)));
        let mut status = relay.status();
        let (cancel, handle) = spawn(relay);

        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == RelayStatus::Idle))
            .await
            .expect("relay did not go idle")
            .unwrap();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("relay did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(*status.borrow(), RelayStatus::Stopped);
    }

    #[tokio::test]
    async fn wake_signal_cuts_idle_sleep_short() {
        let outbox = InMemoryOutbox::new();
        let broker = InMemory::new();
        let wake = Arc::new(Notify::new());
        let relay = relay(outbox.clone(), &broker)
            .with_config(fast_config().with_poll_interval(Duration::from_secs(3600)))
            .with_wake(Arc::clone(&wake));
        let mut status = relay.status();
        let (cancel, handle) = spawn(relay);

        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == RelayStatus::Idle))
            .await
            .expect("relay did not go idle")
            .unwrap();

        TransactionalWriter::new(outbox.clone(), router())
            .with_wake(wake)
            .persist(&(), NewOutboxEvent::new("PaymentCreated", "{}"))
            .await
            .unwrap();

        wait_until_drained(&outbox).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(broker.sent_messages().await.len(), 1);
    }
}
