//! Bounded in-process dispatch queue.
//!
//! Envelopes published through a [`DispatchSender`] are processed one at a
//! time, in order, by a single [`DispatchPump`]. The queue has a fixed
//! capacity: publishing to a full queue waits until the pump takes an
//! envelope out, so a slow consumer slows producers down instead of letting
//! memory grow.
//!
//! This path is best-effort. Nothing is persisted, a failed handler is not
//! retried, and envelopes still queued at shutdown are dropped. Work that must
//! not be lost belongs in the outbox.

mod pump;
mod registry;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

pub use crate::envelope::{BoxedHandler, HandlerFuture, MessageEnvelope};
pub use pump::{DefaultPumpHook, DispatchPump, PumpHook, PumpReport};
pub use registry::HandlerRegistry;

/// Queue capacity used when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Create a dispatch queue holding up to `capacity` envelopes.
///
/// A capacity of zero is raised to one.
pub fn channel<P, C>(capacity: usize) -> (DispatchSender<P, C>, DispatchReceiver<P, C>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (DispatchSender { inner: tx }, DispatchReceiver { inner: rx })
}

/// Producer half of the dispatch queue.
pub struct DispatchSender<P, C> {
    inner: mpsc::Sender<MessageEnvelope<P, C>>,
}

impl<P, C> Clone for DispatchSender<P, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P, C> DispatchSender<P, C> {
    /// Enqueue an envelope, waiting for room if the queue is full.
    ///
    /// Fails only when the pump has shut down.
    pub async fn publish(&self, envelope: MessageEnvelope<P, C>) -> Result<(), DispatchError> {
        self.inner
            .send(envelope)
            .await
            .map_err(|_| DispatchError::closed())
    }

    /// Like [`publish`](Self::publish), but gives up when `cancel` fires
    /// while waiting for room.
    pub async fn publish_with_cancel(
        &self,
        envelope: MessageEnvelope<P, C>,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::cancelled()),
            sent = self.inner.send(envelope) => sent.map_err(|_| DispatchError::closed()),
        }
    }

    /// Free slots right now.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Total number of slots.
    pub fn max_capacity(&self) -> usize {
        self.inner.max_capacity()
    }

    /// Whether the pump is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Consumer half of the dispatch queue, owned by the [`DispatchPump`].
pub struct DispatchReceiver<P, C> {
    inner: mpsc::Receiver<MessageEnvelope<P, C>>,
}

impl<P, C> DispatchReceiver<P, C> {
    async fn recv(&mut self) -> Option<MessageEnvelope<P, C>> {
        self.inner.recv().await
    }

    /// Refuse new envelopes. Those already queued stay readable.
    fn close(&mut self) {
        self.inner.close();
    }

    /// Refuse new envelopes and count the ones left behind.
    fn close_and_drain(&mut self) -> u64 {
        self.close();
        let mut abandoned = 0;
        while self.inner.try_recv().is_ok() {
            abandoned += 1;
        }
        abandoned
    }
}

/// Error returned by dispatch operations.
#[derive(Debug)]
pub struct DispatchError {
    context: SpanTrace,
    kind: DispatchErrorKind,
}

/// Classification of dispatch errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchErrorKind {
    /// The pump stopped; the envelope was not queued.
    Closed,
    /// Publishing was cancelled while waiting for room.
    Cancelled,
    /// No handler is registered under this name.
    UnknownHandler(String),
}

impl DispatchError {
    fn closed() -> Self {
        Self::new(DispatchErrorKind::Closed)
    }

    fn cancelled() -> Self {
        Self::new(DispatchErrorKind::Cancelled)
    }

    pub(crate) fn unknown_handler(name: &str) -> Self {
        Self::new(DispatchErrorKind::UnknownHandler(name.to_owned()))
    }

    fn new(kind: DispatchErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &DispatchErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DispatchErrorKind::Closed => writeln!(f, "Dispatch queue is closed"),
            DispatchErrorKind::Cancelled => writeln!(f, "Publishing was cancelled"),
            DispatchErrorKind::UnknownHandler(name) => {
                writeln!(f, "No handler registered for {name}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DispatchError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn envelope(n: u32) -> MessageEnvelope<u32, ()> {
        MessageEnvelope::new("noop", n, |_, _| async { Ok(()) })
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let (tx, _rx) = channel::<u32, ()>(0);
        assert_eq!(tx.max_capacity(), 1);
    }

    #[tokio::test]
    async fn envelopes_come_out_in_order() {
        let (tx, mut rx) = channel(DEFAULT_QUEUE_CAPACITY);
        for n in 0..5 {
            tx.publish(envelope(n)).await.unwrap();
        }

        for n in 0..5 {
            assert_eq!(*rx.recv().await.unwrap().payload(), n);
        }
    }

    #[tokio::test]
    async fn full_queue_blocks_until_drained() {
        let (tx, mut rx) = channel(1);
        tx.publish(envelope(1)).await.unwrap();
        assert_eq!(tx.capacity(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.publish(envelope(2))).await;
        assert!(blocked.is_err());

        let producer = tokio::spawn({
            let tx = tx.clone();
            async move { tx.publish(envelope(3)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(*rx.recv().await.unwrap().payload(), 1);
        producer.await.unwrap().unwrap();
        assert_eq!(*rx.recv().await.unwrap().payload(), 3);
    }

    #[tokio::test]
    async fn cancelled_publish_gives_up() {
        let (tx, _rx) = channel(1);
        tx.publish(envelope(1)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = tx.publish_with_cancel(envelope(2), &cancel).await.unwrap_err();

        assert_eq!(*err.kind(), DispatchErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn publish_after_shutdown_fails() {
        let (tx, rx) = channel(4);
        drop(rx);

        let err = tx.publish(envelope(1)).await.unwrap_err();

        assert!(tx.is_closed());
        assert_eq!(*err.kind(), DispatchErrorKind::Closed);
    }

    #[tokio::test]
    async fn close_and_drain_counts_leftovers() {
        let (tx, mut rx) = channel(4);
        tx.publish(envelope(1)).await.unwrap();
        tx.publish(envelope(2)).await.unwrap();

        assert_eq!(rx.close_and_drain(), 2);
        assert!(tx.publish(envelope(3)).await.is_err());
    }
}
