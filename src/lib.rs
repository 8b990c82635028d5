#![doc = include_str!("../README.md")]

pub mod dispatch;
mod envelope;
pub mod outbox;
pub mod payments;
pub mod relay;
pub mod router;
pub mod transport;
pub mod writer;

#[doc(inline)]
pub use outbox::{NewOutboxEvent, OutboxError, OutboxErrorKind, OutboxRecord};

#[doc(inline)]
pub use router::{RoutingError, TopicRouter};

#[doc(inline)]
pub use writer::{DomainChange, TransactionalWriter};

#[doc(inline)]
pub use transport::{BrokerMessage, Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use relay::{
    DefaultRelayHook, DeliveryOutcome, OutboxRelay, RelayConfig, RelayHook, RelayRunError,
    RelayRunErrorKind, RelayStatus,
};

#[doc(inline)]
pub use dispatch::{DispatchError, DispatchPump, HandlerRegistry, MessageEnvelope};
