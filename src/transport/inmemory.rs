use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tokio::sync::Mutex;

use crate::transport::{BrokerMessage, Rejected, Sender};

/// In-memory broker for testing or local pipelines.
///
/// Acknowledged messages are kept in a shared log. Failures can be scripted
/// to exercise retry paths:
/// - [`fail_next`](Self::fail_next): the next sends fail transiently
/// - [`fail_message`](Self::fail_message): a given message id fails a number of times
/// - [`reject_destination`](Self::reject_destination): every send to a destination is refused
///
/// Every attempt, successful or not, is recorded in [`attempts`](Self::attempts).
#[derive(Clone, Default)]
pub struct InMemory {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    sent: Vec<BrokerMessage>,
    attempts: Vec<String>,
    failing_sends: usize,
    failing_messages: HashMap<String, usize>,
    rejected_destinations: HashSet<String>,
}

impl InMemory {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the acknowledged messages, in send order.
    pub async fn sent_messages(&self) -> Vec<BrokerMessage> {
        self.state.lock().await.sent.clone()
    }

    /// Return the acknowledged messages and clear the log.
    pub async fn take_sent(&self) -> Vec<BrokerMessage> {
        std::mem::take(&mut self.state.lock().await.sent)
    }

    /// Message ids of every send attempt, in attempt order.
    pub async fn attempts(&self) -> Vec<String> {
        self.state.lock().await.attempts.clone()
    }

    /// Make the next `n` sends fail with a transient error.
    pub async fn fail_next(&self, n: usize) {
        self.state.lock().await.failing_sends = n;
    }

    /// Make the next `times` sends of `message_id` fail with a transient error.
    pub async fn fail_message(&self, message_id: impl Into<String>, times: usize) {
        self.state
            .lock()
            .await
            .failing_messages
            .insert(message_id.into(), times);
    }

    /// Refuse every message addressed to `destination`.
    pub async fn reject_destination(&self, destination: impl Into<String>) {
        self.state
            .lock()
            .await
            .rejected_destinations
            .insert(destination.into());
    }
}

#[async_trait::async_trait]
impl Sender for InMemory {
    type Error = tower::BoxError;

    /// "Send" a message by appending it to the in-memory log.
    #[tracing::instrument(skip_all, fields(message_id = %message.message_id, destination = %message.destination))]
    async fn send(&mut self, message: BrokerMessage) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.attempts.push(message.message_id.clone());

        if state.rejected_destinations.contains(&message.destination) {
            return Err(Box::new(Rejected::new(format!(
                "destination {} refuses messages",
                message.destination
            ))));
        }

        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err("broker unavailable".into());
        }

        if let Some(remaining) = state.failing_messages.get_mut(&message.message_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(format!("broker did not acknowledge {}", message.message_id).into());
            }
        }

        tracing::debug!(subject = %message.subject, "Message sent to in-memory broker");
        state.sent.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, TransportErrorKind};
    use std::collections::BTreeMap;

    fn message(id: &str, destination: &str) -> BrokerMessage {
        BrokerMessage {
            destination: destination.to_owned(),
            message_id: id.to_owned(),
            subject: "PaymentCreated".to_owned(),
            content_type: "application/json".to_owned(),
            body: b"{}".to_vec(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn scripted_failures_are_transient() {
        let broker = InMemory::new();
        broker.fail_message("a", 2).await;
        let mut transport = Transport::new(broker.clone());

        for _ in 0..2 {
            let err = transport.send(message("a", "payments")).await.unwrap_err();
            assert!(matches!(err.kind(), TransportErrorKind::Sender(_)));
        }
        transport.send(message("a", "payments")).await.unwrap();

        assert_eq!(broker.attempts().await, vec!["a", "a", "a"]);
        assert_eq!(broker.sent_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_destination_is_permanent() {
        let broker = InMemory::new();
        broker.reject_destination("audit").await;
        let mut transport = Transport::new(broker.clone());

        let err = transport.send(message("a", "audit")).await.unwrap_err();

        assert!(err.is_permanent());
        assert!(broker.sent_messages().await.is_empty());
    }

    #[tokio::test]
    async fn take_sent_clears_the_log() {
        let broker = InMemory::new();
        let mut transport = Transport::new(broker.clone());
        transport.send(message("a", "payments")).await.unwrap();

        assert_eq!(broker.take_sent().await.len(), 1);
        assert!(broker.sent_messages().await.is_empty());
    }
}
