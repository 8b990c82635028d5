use async_trait::async_trait;
use rdkafka::{
    error::{KafkaError, RDKafkaErrorCode},
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};
use std::time::Duration;

use crate::transport::{BrokerMessage, Rejected, Sender};

/// Header carrying the message content type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";
/// Header carrying the event name.
pub const SUBJECT_HEADER: &str = "subject";

/// Kafka transport sender.
///
/// Publishes each [`BrokerMessage`] to the topic named by its destination and
/// waits for the delivery report. The message id is used as record key, and
/// the subject, content type and metadata travel as Kafka headers.
#[derive(Clone)]
pub struct Kafka {
    /// Kafka producer handle
    producer: FutureProducer,
    /// Timeout for sending messages
    timeout: Duration,
}

impl Kafka {
    /// Create a new Kafka sender using the given `FutureProducer`.
    ///
    /// Default timeout is 5 seconds.
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set a custom timeout for sending messages.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Sender for Kafka {
    type Error = tower::BoxError;

    #[tracing::instrument(skip_all, fields(topic = %message.destination, message_id = %message.message_id))]
    async fn send(&mut self, message: BrokerMessage) -> Result<(), Self::Error> {
        let headers = headers(&message);
        let record = FutureRecord::to(&message.destination)
            .payload(&message.body)
            .key(&message.message_id)
            .headers(headers);

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| classify(e))?;

        Ok(())
    }
}

fn headers(message: &BrokerMessage) -> OwnedHeaders {
    let headers = OwnedHeaders::new()
        .insert(Header {
            key: CONTENT_TYPE_HEADER,
            value: Some(message.content_type.as_str()),
        })
        .insert(Header {
            key: SUBJECT_HEADER,
            value: Some(message.subject.as_str()),
        });

    message.metadata.iter().fold(headers, |headers, (key, value)| {
        headers.insert(Header {
            key: key.as_str(),
            value: Some(value.as_str()),
        })
    })
}

/// Errors that concern the message itself are permanent.
fn classify(err: KafkaError) -> tower::BoxError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::InvalidMessage,
        ) => tower::BoxError::from(Rejected::new(err)),
        _ => tower::BoxError::from(err),
    }
}
