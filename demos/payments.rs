use std::{sync::Arc, time::Duration};

use eventrelay::{
    OutboxRelay, RelayConfig, TopicRouter, TransactionalWriter, Transport,
    dispatch::{self, DispatchPump, DispatchSender, HandlerRegistry},
    outbox::{FetchPending, inmemory::InMemoryOutbox},
    payments::{
        InMemoryPayments, Money, PAYMENT_CREATED, PAYMENTS_TOPIC, Payment, PaymentCommandHandler,
    },
    transport,
};
use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

type Handler = PaymentCommandHandler<InMemoryOutbox, InMemoryPayments>;

const CREATE_PAYMENT: &str = "create_payment";
const MERCHANTS: [Uuid; 2] = [
    Uuid::from_u128(0x11111111_1111_1111_1111_111111111111),
    Uuid::from_u128(0x22222222_2222_2222_2222_222222222222),
];

/// Publish a batch of random payments every `pace` until cancelled.
async fn simulate(
    sender: DispatchSender<Payment, Handler>,
    registry: HandlerRegistry<Payment, Handler>,
    pace: Duration,
    cancel: CancellationToken,
) {
    const BATCH_SIZE: usize = 10;
    tracing::info!("Payment simulator started");

    while !cancel.is_cancelled() {
        for _ in 0..BATCH_SIZE {
            let (merchant, amount) = {
                let mut rng = rand::thread_rng();
                (MERCHANTS[rng.gen_range(0..MERCHANTS.len())], rng.gen_range(100..=100_000))
            };
            let payment = Money::new(amount, "EUR")
                .and_then(|amount| Payment::new(Uuid::new_v4(), merchant, amount))
                .expect("simulated payments are valid");
            let envelope = registry
                .envelope(CREATE_PAYMENT, payment)
                .expect("handler is registered");

            if let Err(err) = sender.publish_with_cancel(envelope, &cancel).await {
                tracing::info!(%err, "Payment simulator stopped publishing");
                return;
            }
        }
        tracing::info!(count = BATCH_SIZE, "Payment simulator published messages");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pace) => {}
        }
    }

    tracing::info!("Payment simulator stopped");
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(ErrorLayer::default())
        .init();

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let router = TopicRouter::new().route(PAYMENT_CREATED, PAYMENTS_TOPIC);
    let outbox = InMemoryOutbox::new();
    let payments = InMemoryPayments::new();
    let broker = transport::InMemory::new();
    let wake = Arc::new(Notify::new());

    let writer = TransactionalWriter::new(outbox.clone(), router.clone()).with_wake(Arc::clone(&wake));
    let handler = PaymentCommandHandler::new(writer, payments.clone());

    let registry = HandlerRegistry::<Payment, Handler>::new().register(
        CREATE_PAYMENT,
        |payment, handler: Handler| async move {
            handler
                .handle(payment)
                .await
                .map(|_| ())
                .map_err(tower::BoxError::from)
        },
    );
    let (sender, receiver) = dispatch::channel(dispatch::DEFAULT_QUEUE_CAPACITY);

    let pump_handle = tokio::spawn(
        DispatchPump::new(receiver, move || handler.clone()).run(cancel.clone()),
    );

    let relay = OutboxRelay::new(outbox.clone(), router, Transport::new(broker.clone()))
        .with_config(RelayConfig::default().with_poll_interval(Duration::from_secs(1)))
        .with_wake(wake);
    let relay_handle = tokio::spawn(relay.run(cancel.clone()));

    let simulator_handle = tokio::spawn(simulate(
        sender,
        registry,
        Duration::from_secs(10),
        cancel.clone(),
    ));

    let (_, report, relay_result, _) =
        tokio::try_join!(cancel_handle, pump_handle, relay_handle, simulator_handle)
            .expect("a worker panicked");
    if let Err(err) = relay_result {
        tracing::error!(%err, "Relay stopped with an error");
    }

    let pending = outbox.pending_count().await.unwrap_or_default();
    tracing::info!(
        payments = payments.len(),
        published = broker.sent_messages().await.len(),
        pending,
        processed = report.processed,
        failed = report.failed,
        abandoned = report.abandoned,
        "Payments demo finished"
    );
}
