//! Transport seam between the connection manager and a concrete broker client.
//!
//! The manager only ever talks to these traits. Production wiring uses the
//! AMQP transport (`amqp` feature); tests use
//! [`InMemoryTransport`](super::memory::InMemoryTransport).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use super::config::ConnectionOptions;

/// Stream of deliveries from a consumed queue. Ends when the consumer is
/// cancelled or the channel closes.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// One message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw message body.
    pub body: Bytes,
}

impl Delivery {
    #[must_use]
    pub fn new(routing_key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
        }
    }
}

/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes by exact routing key.
    Direct,
    /// Routes by routing-key pattern.
    Topic,
}

/// Exchange declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
}

/// Transport-level failure or broker-initiated close.
///
/// Always recoverable: the connection manager reports it through the
/// `error` event and reconnects with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to open broker connection: {0}")]
    Connect(String),
    #[error("failed to open channel: {0}")]
    Channel(String),
    #[error("topology step `{step}` failed: {reason}")]
    Topology { step: String, reason: String },
    #[error("failed to start consumer on `{queue}`: {reason}")]
    Consume { queue: String, reason: String },
    #[error("publish to `{exchange}` failed: {reason}")]
    Publish { exchange: String, reason: String },
    #[error("broker closed the connection: {0}")]
    Closed(String),
    #[error("consumer stream ended")]
    ConsumerEnded,
}

/// Opens broker connections. Injected into the connection manager so tests
/// can replace the network client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new connection.
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>, ConnectionError>;
}

/// An established broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, ConnectionError>;

    /// Resolves once the connection is closed by the broker or fails.
    async fn closed(&self) -> ConnectionError;

    /// Closes the connection from our side.
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// A channel on a broker connection. All declarations are idempotent on the
/// broker side, so re-running them after a partial failure is safe.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), ConnectionError>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), ConnectionError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), ConnectionError>;

    /// Starts consuming `queue`. Deliveries are acknowledged on receipt.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, ConnectionError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), ConnectionError>;
}
