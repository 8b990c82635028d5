use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    BasicProperties,
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use tokio::sync::Mutex;

use crate::transport::{BrokerMessage, Rejected, Sender};

/// RabbitMQ transport sender.
///
/// This sender publishes messages to a RabbitMQ exchange using a shared
/// `lapin::Channel`.
///
/// ## Design
///
/// - Messages are published to a **single exchange**
/// - The message destination is used as routing key
/// - Message id, subject and content type map to AMQP properties
/// - Metadata is mapped to **AMQP message headers**
///
/// The channel is wrapped in `Arc<Mutex<_>>` because `Sender::send` is async
/// and may be called concurrently from clones of the sender.
///
/// Publisher confirms should be enabled on the channel
/// (`confirm_select`); a broker `nack` is reported as a permanent rejection.
#[derive(Clone)]
pub struct RabbitMq {
    /// Shared AMQP channel used for publishing.
    channel: Arc<Mutex<lapin::Channel>>,
    /// Target exchange name.
    exchange: String,
}

impl RabbitMq {
    /// Create a sender publishing to `exchange` over `channel`.
    pub fn new(channel: lapin::Channel, exchange: impl Into<String>) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
            exchange: exchange.into(),
        }
    }
}

#[async_trait]
impl Sender for RabbitMq {
    type Error = tower::BoxError;

    /// Publish a message to RabbitMQ.
    ///
    /// The call waits for both the publish to be sent and the broker
    /// confirmation.
    #[tracing::instrument(skip_all, fields(exchange = %self.exchange, routing_key = %message.destination))]
    async fn send(&mut self, message: BrokerMessage) -> Result<(), Self::Error> {
        let properties = properties(&message);

        let channel = self.channel.lock().await;
        let confirmation = channel
            .basic_publish(
                &self.exchange,
                &message.destination,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(Box::new(Rejected::new(format!(
                "broker nacked message {}",
                message.message_id
            ))));
        }

        Ok(())
    }
}

fn properties(message: &BrokerMessage) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (key, value) in &message.metadata {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    BasicProperties::default()
        .with_message_id(ShortString::from(message.message_id.clone()))
        .with_content_type(ShortString::from(message.content_type.clone()))
        .with_kind(ShortString::from(message.subject.clone()))
        .with_headers(headers)
}
