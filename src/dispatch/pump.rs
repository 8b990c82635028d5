use std::any::Any;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatch::DispatchReceiver;

/// Counters returned when the pump stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// Envelopes whose handler succeeded.
    pub processed: u64,
    /// Envelopes whose handler returned an error or panicked.
    pub failed: u64,
    /// Envelopes still queued at shutdown, dropped unprocessed.
    pub abandoned: u64,
}

/// Single consumer of the dispatch queue.
///
/// The pump takes envelopes one at a time and runs each handler to
/// completion before taking the next, which keeps processing in queue order.
/// Every handler gets a context freshly built by the factory and runs in its
/// own task: an error or a panic is reported and the envelope dropped, and
/// the pump moves on.
///
/// Generic parameters:
/// - `P`: Payload type
/// - `C`: Handler context type
/// - `F`: Context factory
/// - `HK`: Hook implementation for lifecycle events
pub struct DispatchPump<P, C, F, HK> {
    receiver: DispatchReceiver<P, C>,
    context: F,
    hook: HK,
}

impl<P, C, F> DispatchPump<P, C, F, DefaultPumpHook>
where
    F: Fn() -> C,
{
    /// Create a pump draining `receiver`, building one context per envelope
    /// with `context`.
    pub fn new(receiver: DispatchReceiver<P, C>, context: F) -> Self {
        Self {
            receiver,
            context,
            hook: DefaultPumpHook,
        }
    }
}

impl<P, C, F, HK> DispatchPump<P, C, F, HK>
where
    P: Send + 'static,
    C: Send + 'static,
    F: Fn() -> C + Send,
    HK: PumpHook,
{
    /// Replace the pump hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: PumpHook>(self, hook: HK2) -> DispatchPump<P, C, F, HK2> {
        DispatchPump {
            receiver: self.receiver,
            context: self.context,
            hook,
        }
    }

    /// Run the pump until `cancel` fires or every sender is dropped.
    ///
    /// On cancellation the queue stops accepting envelopes right away and
    /// publishers get [`DispatchErrorKind::Closed`](crate::dispatch::DispatchErrorKind::Closed).
    /// The envelope being handled is finished; the ones still queued are
    /// dropped and counted in [`PumpReport::abandoned`].
    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) -> PumpReport {
        self.hook.on_startup();
        let mut report = PumpReport::default();

        loop {
            let envelope = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.receiver.recv() => match next {
                    Some(envelope) => envelope,
                    None => {
                        self.hook.on_queue_closed();
                        break;
                    }
                },
            };

            let id = envelope.id();
            let handler = envelope.handler_name().to_owned();
            self.hook.on_envelope_received(id, &handler);

            let ctx = (self.context)();
            let mut task = tokio::spawn(async move { envelope.dispatch(ctx).await });

            // Shutdown closes the queue at once, then lets the handler finish.
            let joined = tokio::select! {
                biased;
                joined = &mut task => joined,
                _ = cancel.cancelled() => {
                    self.receiver.close();
                    task.await
                }
            };

            match joined {
                Ok(Ok(())) => {
                    report.processed += 1;
                    self.hook.on_envelope_handled(id, &handler);
                }
                Ok(Err(err)) => {
                    report.failed += 1;
                    self.hook.on_handler_error(id, &handler, err.as_ref());
                }
                Err(err) => {
                    report.failed += 1;
                    self.hook.on_handler_panic(id, &handler, &panic_message(err));
                }
            }
        }

        report.abandoned = self.receiver.close_and_drain();
        self.hook.on_shutdown(&report);
        report
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload_message(payload.as_ref()),
        Err(err) => err.to_string(),
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_owned()
    }
}

/// Hook trait for observing pump lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait PumpHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self, report: &PumpReport);
    fn on_envelope_received(&self, envelope_id: Uuid, handler: &str);
    fn on_envelope_handled(&self, envelope_id: Uuid, handler: &str);
    fn on_handler_error(&self, envelope_id: Uuid, handler: &str, error: &dyn std::error::Error);
    fn on_handler_panic(&self, envelope_id: Uuid, handler: &str, message: &str);
    fn on_queue_closed(&self);
}

/// Default pump hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultPumpHook;

impl PumpHook for DefaultPumpHook {
    fn on_startup(&self) {
        tracing::info!("Dispatch pump is starting up");
    }

    fn on_shutdown(&self, report: &PumpReport) {
        if report.abandoned > 0 {
            tracing::warn!(
                abandoned = report.abandoned,
                "Dispatch pump stopped with queued envelopes, they are dropped"
            );
        }
        tracing::info!(
            processed = report.processed,
            failed = report.failed,
            "Dispatch pump is shutting down"
        );
    }

    fn on_envelope_received(&self, envelope_id: Uuid, handler: &str) {
        tracing::debug!(%envelope_id, handler, "Envelope received");
    }

    fn on_envelope_handled(&self, envelope_id: Uuid, handler: &str) {
        tracing::debug!(%envelope_id, handler, "Envelope handled");
    }

    fn on_handler_error(&self, envelope_id: Uuid, handler: &str, error: &dyn std::error::Error) {
        tracing::error!(%envelope_id, handler, %error, "Handler failed, envelope dropped");
    }

    fn on_handler_panic(&self, envelope_id: Uuid, handler: &str, message: &str) {
        tracing::error!(%envelope_id, handler, message, "Handler panicked, envelope dropped");
    }

    fn on_queue_closed(&self) {
        tracing::info!("Every dispatch sender was dropped");
    }
}
