//! Reply publishing with outgoing validation and fallback substitution.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use brokerline_core::{EnvelopeValidator, ErrorEnvelope, OutboundResponse, ValidationResult};
use serde_json::Value;
use tracing::{debug, warn};

use crate::broker::{BrokerChannel, ConnectionError};

/// What happened to one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The payload passed validation and was published as-is.
    Published,
    /// The payload failed validation; the server-error envelope was
    /// published in its place.
    Substituted,
    /// No reply channel was attached. Nothing was sent.
    NoChannel,
    /// The broker rejected the publish.
    Failed(ConnectionError),
}

struct ReplyChannel(Arc<dyn BrokerChannel>);

/// Publishes replies to the reply exchange.
///
/// Holds only a swappable read handle to the channel: the connection manager
/// attaches it when the connection becomes ready and detaches it on close.
/// Replies are not deduplicated; sending twice for one id publishes twice.
pub struct ResponsePublisher {
    exchange: String,
    channel: ArcSwapOption<ReplyChannel>,
    validator: Arc<dyn EnvelopeValidator>,
}

impl ResponsePublisher {
    #[must_use]
    pub fn new(exchange: impl Into<String>, validator: Arc<dyn EnvelopeValidator>) -> Self {
        Self {
            exchange: exchange.into(),
            channel: ArcSwapOption::empty(),
            validator,
        }
    }

    pub fn attach(&self, channel: Arc<dyn BrokerChannel>) {
        self.channel.store(Some(Arc::new(ReplyChannel(channel))));
    }

    pub fn detach(&self) {
        self.channel.store(None);
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.channel.load().is_some()
    }

    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Validates and publishes one reply.
    ///
    /// An invalid payload is logged and replaced by
    /// `{msg_id, msg_intention, status: 500}`. Failures are logged and
    /// reported in the outcome, never returned as errors.
    pub async fn send(
        &self,
        routing_key: &str,
        msg_id: i64,
        msg_intention: &str,
        payload: &Value,
    ) -> PublishOutcome {
        let (body, substituted) = match self.validator.validate(payload) {
            ValidationResult::Valid => (payload.to_string(), false),
            ValidationResult::Invalid { errors } => {
                warn!(
                    msg_id,
                    routing_key,
                    errors = %errors.join("; "),
                    rejected = %payload,
                    "reply failed validation, sending server error"
                );
                let fallback = ErrorEnvelope::server_error(msg_id, msg_intention).into_value();
                (fallback.to_string(), true)
            }
        };

        let Some(channel) = self.channel.load_full() else {
            warn!(msg_id, routing_key, "no reply channel attached, reply dropped");
            record("no_channel");
            return PublishOutcome::NoChannel;
        };

        match channel
            .0
            .publish(&self.exchange, routing_key, body.as_bytes())
            .await
        {
            Ok(()) if substituted => {
                record("substituted");
                PublishOutcome::Substituted
            }
            Ok(()) => {
                debug!(msg_id, routing_key, exchange = %self.exchange, "reply published");
                record("published");
                PublishOutcome::Published
            }
            Err(err) => {
                warn!(msg_id, routing_key, error = %err, "reply publish failed");
                record("failed");
                PublishOutcome::Failed(err)
            }
        }
    }
}

fn record(outcome: &'static str) {
    metrics::counter!("brokerline_replies_total", "outcome" => outcome).increment(1);
}

// ---------------------------------------------------------------------------
// ReplyHandle
// ---------------------------------------------------------------------------

/// Reply callback bound to one request's id, intention and routing key.
#[derive(Clone)]
pub struct ReplyHandle {
    msg_id: i64,
    msg_intention: String,
    routing_key: String,
    publisher: Arc<ResponsePublisher>,
}

impl ReplyHandle {
    #[must_use]
    pub fn new(
        msg_id: i64,
        msg_intention: impl Into<String>,
        routing_key: impl Into<String>,
        publisher: Arc<ResponsePublisher>,
    ) -> Self {
        Self {
            msg_id,
            msg_intention: msg_intention.into(),
            routing_key: routing_key.into(),
            publisher,
        }
    }

    #[must_use]
    pub fn msg_id(&self) -> i64 {
        self.msg_id
    }

    #[must_use]
    pub fn msg_intention(&self) -> &str {
        &self.msg_intention
    }

    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Publishes an arbitrary payload as the reply to this request.
    pub async fn send(&self, payload: Value) -> PublishOutcome {
        self.publisher
            .send(&self.routing_key, self.msg_id, &self.msg_intention, &payload)
            .await
    }

    /// Publishes `{msg_id, msg_intention, status, result}` echoing this
    /// request's correlation fields.
    pub async fn respond(&self, status: i64, result: Vec<Value>) -> PublishOutcome {
        let response = OutboundResponse::new(self.msg_id, self.msg_intention.clone(), status, result);
        self.send(response.into_value()).await
    }
}

impl fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("msg_id", &self.msg_id)
            .field("msg_intention", &self.msg_intention)
            .field("routing_key", &self.routing_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use brokerline_core::{status, EnvelopeSchema};
    use serde_json::json;

    use super::*;
    use crate::broker::memory::InMemoryTransport;
    use crate::broker::{ConnectionOptions, Transport};

    async fn attached() -> (InMemoryTransport, Arc<ResponsePublisher>) {
        let transport = InMemoryTransport::new();
        let conn = transport.connect(&ConnectionOptions::default()).await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        let publisher = Arc::new(ResponsePublisher::new(
            "replies",
            Arc::new(EnvelopeSchema::outgoing()),
        ));
        publisher.attach(channel);
        (transport, publisher)
    }

    #[tokio::test]
    async fn valid_reply_is_published_verbatim() {
        let (transport, publisher) = attached().await;
        let payload = json!({"msg_id": 7, "msg_intention": "READ", "status": 200, "result": [{"id": 1}]});

        let outcome = publisher.send("orders.read", 7, "READ", &payload).await;

        assert_eq!(outcome, PublishOutcome::Published);
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "replies");
        assert_eq!(published[0].routing_key, "orders.read");
        assert_eq!(published[0].json(), payload);
    }

    #[tokio::test]
    async fn invalid_reply_is_replaced_by_server_error() {
        let (transport, publisher) = attached().await;

        let outcome = publisher
            .send("orders.update", 9, "UPDATE", &json!({"oops": true}))
            .await;

        assert_eq!(outcome, PublishOutcome::Substituted);
        assert_eq!(
            transport.published()[0].json(),
            json!({"msg_id": 9, "msg_intention": "UPDATE", "status": 500})
        );
    }

    #[tokio::test]
    async fn detached_publisher_is_a_no_op() {
        let (transport, publisher) = attached().await;
        publisher.detach();
        assert!(!publisher.is_attached());

        let outcome = publisher
            .send("k", 1, "READ", &json!({"msg_id": 1, "msg_intention": "READ", "status": 200, "result": []}))
            .await;

        assert_eq!(outcome, PublishOutcome::NoChannel);
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_reported() {
        let (transport, publisher) = attached().await;
        transport.set_fail_publishes(true);

        let outcome = publisher
            .send("k", 1, "READ", &json!({"msg_id": 1, "msg_intention": "READ", "status": 200, "result": []}))
            .await;

        assert!(matches!(outcome, PublishOutcome::Failed(ConnectionError::Publish { .. })));
    }

    #[tokio::test]
    async fn reply_handle_echoes_correlation_fields() {
        let (transport, publisher) = attached().await;
        let handle = ReplyHandle::new(42, "CREATE", "users.create", publisher);

        handle.respond(status::CREATED, vec![json!(42)]).await;

        let published = transport.published();
        assert_eq!(published[0].routing_key, "users.create");
        assert_eq!(
            published[0].json(),
            json!({"msg_id": 42, "msg_intention": "CREATE", "status": 201, "result": [42]})
        );
    }

    #[tokio::test]
    async fn repeated_replies_are_not_deduplicated() {
        let (transport, publisher) = attached().await;
        let handle = ReplyHandle::new(3, "DELETE", "users.delete", publisher);

        handle.respond(status::OK, vec![json!(3)]).await;
        handle.respond(status::OK, vec![json!(3)]).await;

        assert_eq!(transport.published().len(), 2);
    }
}
