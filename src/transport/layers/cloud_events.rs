use serde::Serialize;
use std::pin::Pin;
use tower::{Layer, Service};

use crate::transport::{BrokerMessage, CREATED_AT, TransportError};

/// Content type of a structured-mode JSON CloudEvent.
pub const CLOUD_EVENTS_CONTENT_TYPE: &str = "application/cloudevents+json";

/// Tower `Service` wrapper that converts messages into JSON CloudEvents format.
///
/// The outbox payload becomes the `data` member of a structured CloudEvent;
/// the message id, subject and creation time fill the matching attributes.
/// Payloads that are not valid JSON fail with a serde error, which the relay
/// treats as permanent.
#[derive(Clone)]
pub struct CloudEventsService<T> {
    inner: T,
    source: String,
}

impl<T> Service<BrokerMessage> for CloudEventsService<T>
where
    T: Service<BrokerMessage> + Clone + Send + 'static,
    T::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: BrokerMessage) -> Self::Future {
        let source = self.source.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let message = to_cloud_event(req, &source)?;
            inner.call(message).await.map_err(Into::into)
        })
    }
}

fn to_cloud_event(mut req: BrokerMessage, source: &str) -> Result<BrokerMessage, TransportError> {
    let data: serde_json::Value =
        serde_json::from_slice(&req.body).map_err(|e| TransportError::serde(Box::new(e)))?;
    let time = req
        .metadata
        .get(CREATED_AT)
        .cloned()
        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());

    let event = CloudEventsMessage {
        specversion: "1.0".to_owned(),
        source: source.to_owned(),
        subject: req.subject.clone(),
        id: req.message_id.clone(),
        r#type: req.subject.clone(),
        datacontenttype: req.content_type.clone(),
        data,
        time,
    };

    req.body = serde_json::to_vec(&event).map_err(|e| TransportError::serde(Box::new(e)))?;
    req.content_type = CLOUD_EVENTS_CONTENT_TYPE.to_owned();
    Ok(req)
}

/// Tower `Layer` that applies `CloudEventsService` to a service stack.
///
/// This layer is used to wrap an existing service so that all outgoing messages
/// are transformed into CloudEvents JSON before reaching the inner transport.
pub struct CloudEventsLayer {
    source: String,
}

impl CloudEventsLayer {
    /// Create a new layer specifying the CloudEvents `source` field.
    pub fn new(source: impl ToString) -> Self {
        Self {
            source: source.to_string(),
        }
    }
}

impl<S> Layer<S> for CloudEventsLayer {
    type Service = CloudEventsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        CloudEventsService {
            source: self.source.clone(),
            inner: service,
        }
    }
}

/// JSON CloudEvents message structure.
#[derive(Clone, Debug, Serialize)]
pub struct CloudEventsMessage {
    pub specversion: String,
    pub source: String,
    pub subject: String,
    pub id: String,
    pub r#type: String,
    pub datacontenttype: String,
    pub data: serde_json::Value,
    pub time: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemory, Transport};
    use std::collections::BTreeMap;

    fn message(body: &[u8]) -> BrokerMessage {
        BrokerMessage {
            destination: "payments".into(),
            message_id: "id-1".into(),
            subject: "PaymentCreated".into(),
            content_type: "application/json".into(),
            body: body.to_vec(),
            metadata: BTreeMap::from([(CREATED_AT.to_owned(), "2024-01-01T00:00:00+00:00".to_owned())]),
        }
    }

    #[tokio::test]
    async fn wraps_payload_in_cloud_event() {
        let broker = InMemory::new();
        let mut transport = Transport::new(broker.clone()).layer(CloudEventsLayer::new("billing"));

        transport.send(message(br#"{"amount":5}"#)).await.unwrap();

        let sent = broker.sent_messages().await;
        assert_eq!(sent[0].content_type, CLOUD_EVENTS_CONTENT_TYPE);
        let event: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
        assert_eq!(event["specversion"], "1.0");
        assert_eq!(event["source"], "billing");
        assert_eq!(event["id"], "id-1");
        assert_eq!(event["type"], "PaymentCreated");
        assert_eq!(event["time"], "2024-01-01T00:00:00+00:00");
        assert_eq!(event["data"]["amount"], 5);
    }

    #[tokio::test]
    async fn invalid_json_is_permanent() {
        let broker = InMemory::new();
        let mut transport = Transport::new(broker.clone()).layer(CloudEventsLayer::new("billing"));

        let err = transport.send(message(b"not json")).await.unwrap_err();

        assert!(err.is_permanent());
        assert!(broker.attempts().await.is_empty());
    }
}
