//! Turns raw deliveries into typed events.

use std::sync::Arc;

use brokerline_core::{EnvelopeValidator, InboundMessage, Intention, ValidationResult};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::error::{BindingContractError, ProtocolError, ServiceError};
use super::events::{Dispatched, Event, EventKind, EventRegistry, Request};
use super::publisher::{ReplyHandle, ResponsePublisher};
use crate::broker::Delivery;

/// Result of dispatching one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The request was emitted; `handlers` tasks were spawned for it.
    Emitted { kind: EventKind, handlers: usize },
    /// The delivery was unusable and dropped without a reply or event.
    Dropped(ProtocolError),
    /// A routed listener rejected the request's intention. The other
    /// listeners still ran; `handlers` tasks were spawned for them.
    ContractViolation {
        violation: BindingContractError,
        handlers: usize,
    },
}

/// Maps a classified intention onto its request channel.
#[must_use]
pub fn classify(intention: &Intention) -> EventKind {
    match intention {
        Intention::Create => EventKind::Create,
        Intention::Read => EventKind::Read,
        Intention::Update => EventKind::Update,
        Intention::Delete => EventKind::Delete,
        Intention::Other(_) | Intention::Missing => EventKind::Any,
    }
}

/// Parses, validates and classifies deliveries, then emits them.
///
/// Never awaits a handler: `dispatch` returns as soon as the handler tasks
/// are spawned, so deliveries are dispatched in order while handlers
/// complete in any order.
pub struct MessageDispatcher {
    registry: Arc<EventRegistry>,
    publisher: Arc<ResponsePublisher>,
    validator: Arc<dyn EnvelopeValidator>,
}

impl MessageDispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<EventRegistry>,
        publisher: Arc<ResponsePublisher>,
        validator: Arc<dyn EnvelopeValidator>,
    ) -> Self {
        Self {
            registry,
            publisher,
            validator,
        }
    }

    pub fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        let message = match self.decode(&delivery.body) {
            Ok(message) => message,
            Err(err) => {
                warn!(routing_key = %delivery.routing_key, error = %err, "dropping delivery");
                metrics::counter!("brokerline_messages_dropped_total", "reason" => drop_reason(&err))
                    .increment(1);
                return DispatchOutcome::Dropped(err);
            }
        };

        let intention = message.intention();
        let kind = classify(&intention);
        let request = Request {
            routing_key: delivery.routing_key.clone(),
            reply: ReplyHandle::new(
                message.msg_id,
                intention.as_wire(),
                delivery.routing_key.clone(),
                Arc::clone(&self.publisher),
            ),
            message: Arc::new(message),
        };
        let msg_id = request.message.msg_id;

        let Dispatched { handlers, violation } =
            self.registry.dispatch(Event::for_request(kind, request));
        debug!(msg_id, routing_key = %delivery.routing_key, kind = %kind, handlers, "request dispatched");
        let Some(violation) = violation else {
            return DispatchOutcome::Emitted { kind, handlers };
        };

        error!(msg_id, routing_key = %delivery.routing_key, error = %violation, "binding contract violated");
        let report = Event::Error(Arc::new(ServiceError::Contract(violation.clone())));
        if let Some(nested) = self.registry.dispatch(report).violation {
            error!(error = %nested, "error listener violated its binding contract");
        }
        DispatchOutcome::ContractViolation { violation, handlers }
    }

    fn decode(&self, body: &[u8]) -> Result<InboundMessage, ProtocolError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if let ValidationResult::Invalid { errors } = self.validator.validate(&value) {
            return Err(ProtocolError::Invalid { errors });
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Undecodable(e.to_string()))
    }
}

fn drop_reason(err: &ProtocolError) -> &'static str {
    match err {
        ProtocolError::Malformed(_) => "malformed",
        ProtocolError::Invalid { .. } => "invalid",
        ProtocolError::Undecodable(_) => "undecodable",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use brokerline_core::EnvelopeSchema;
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    use super::*;
    use crate::dispatch::events::HandlerFuture;

    fn dispatcher() -> (Arc<EventRegistry>, MessageDispatcher) {
        let registry = Arc::new(EventRegistry::new());
        let publisher = Arc::new(ResponsePublisher::new(
            "replies",
            Arc::new(EnvelopeSchema::outgoing()),
        ));
        let dispatcher = MessageDispatcher::new(
            Arc::clone(&registry),
            publisher,
            Arc::new(EnvelopeSchema::incoming()),
        );
        (registry, dispatcher)
    }

    /// Counts synchronous listener invocations on every channel.
    fn count_all(registry: &EventRegistry) -> Vec<(EventKind, Arc<AtomicU32>)> {
        EventKind::ALL
            .iter()
            .map(|&kind| {
                let count = Arc::new(AtomicU32::new(0));
                let c = Arc::clone(&count);
                registry.on(kind, move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                });
                (kind, count)
            })
            .collect()
    }

    fn fired(counts: &[(EventKind, Arc<AtomicU32>)]) -> Vec<EventKind> {
        counts
            .iter()
            .filter(|(_, c)| c.load(Ordering::SeqCst) > 0)
            .map(|(k, _)| *k)
            .collect()
    }

    #[test]
    fn classification() {
        assert_eq!(classify(&Intention::Create), EventKind::Create);
        assert_eq!(classify(&Intention::Delete), EventKind::Delete);
        assert_eq!(classify(&Intention::Other("PATCH".to_string())), EventKind::Any);
        assert_eq!(classify(&Intention::Missing), EventKind::Any);
    }

    #[tokio::test]
    async fn each_crud_intention_fires_only_its_channel() {
        for (intention, kind) in [
            ("CREATE", EventKind::Create),
            ("READ", EventKind::Read),
            ("UPDATE", EventKind::Update),
            ("DELETE", EventKind::Delete),
        ] {
            let (registry, dispatcher) = dispatcher();
            let counts = count_all(&registry);
            let body = format!(r#"{{"msg_id": 1, "msg_intention": "{intention}"}}"#);

            let outcome = dispatcher.dispatch(&Delivery::new("orders.x", body));

            assert_eq!(outcome, DispatchOutcome::Emitted { kind, handlers: 1 });
            assert_eq!(fired(&counts), vec![kind]);
        }
    }

    #[tokio::test]
    async fn unknown_and_missing_intentions_fire_any() {
        for body in [r#"{"msg_id": 1, "msg_intention": "PATCH"}"#, r#"{"msg_id": 2}"#] {
            let (registry, dispatcher) = dispatcher();
            let counts = count_all(&registry);

            dispatcher.dispatch(&Delivery::new("k", body));

            assert_eq!(fired(&counts), vec![EventKind::Any]);
        }
    }

    #[tokio::test]
    async fn intention_match_is_case_sensitive() {
        let (registry, dispatcher) = dispatcher();
        let counts = count_all(&registry);

        dispatcher.dispatch(&Delivery::new("k", r#"{"msg_id": 1, "msg_intention": "create"}"#));

        assert_eq!(fired(&counts), vec![EventKind::Any]);
    }

    #[tokio::test]
    async fn malformed_bytes_are_dropped_silently() {
        let (registry, dispatcher) = dispatcher();
        let counts = count_all(&registry);

        let outcome = dispatcher.dispatch(&Delivery::new("k", "{not json"));

        assert!(matches!(outcome, DispatchOutcome::Dropped(ProtocolError::Malformed(_))));
        assert!(fired(&counts).is_empty());
    }

    #[tokio::test]
    async fn schema_invalid_messages_are_dropped() {
        let (registry, dispatcher) = dispatcher();
        let counts = count_all(&registry);

        let outcome = dispatcher.dispatch(&Delivery::new("k", r#"{"msg_id": "seven"}"#));

        assert!(matches!(outcome, DispatchOutcome::Dropped(ProtocolError::Invalid { .. })));
        assert!(fired(&counts).is_empty());
    }

    #[tokio::test]
    async fn null_status_is_treated_as_absent() {
        let (registry, dispatcher) = dispatcher();
        let counts = count_all(&registry);

        let outcome = dispatcher.dispatch(&Delivery::new(
            "k",
            r#"{"msg_id": 1, "msg_intention": "READ", "status": null}"#,
        ));

        assert_eq!(outcome, DispatchOutcome::Emitted { kind: EventKind::Read, handlers: 1 });
        assert_eq!(fired(&counts), vec![EventKind::Read]);
    }

    #[tokio::test]
    async fn ids_beyond_i64_are_invalid_not_undecodable() {
        let (registry, dispatcher) = dispatcher();
        let counts = count_all(&registry);

        let outcome = dispatcher.dispatch(&Delivery::new(
            "k",
            r#"{"msg_id": 9223372036854775808, "msg_intention": "READ"}"#,
        ));

        assert!(matches!(outcome, DispatchOutcome::Dropped(ProtocolError::Invalid { .. })));
        assert!(fired(&counts).is_empty());
    }

    #[tokio::test]
    async fn request_carries_body_fields_and_reply_binding() {
        let (registry, dispatcher) = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.on(EventKind::Read, move |event| {
            let tx = tx.clone();
            async move {
                if let Some(request) = event.request() {
                    let _ = tx.send(request.clone());
                }
                Ok(())
            }
        });

        dispatcher.dispatch(&Delivery::new(
            "users.read",
            r#"{"msg_id": 11, "msg_intention": "READ", "userID": "u-1", "name": "ada"}"#,
        ));

        let request = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.routing_key, "users.read");
        assert_eq!(request.message.user_id.as_deref(), Some("u-1"));
        assert_eq!(request.message.field("name"), Some(&serde_json::json!("ada")));
        assert_eq!(request.reply.msg_id(), 11);
        assert_eq!(request.reply.msg_intention(), "READ");
        assert_eq!(request.reply.routing_key(), "users.read");
    }

    #[tokio::test]
    async fn contract_violation_is_reported_and_emitted() {
        let (registry, dispatcher) = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.on(EventKind::Error, move |event| {
            let tx = tx.clone();
            async move {
                if let Event::Error(err) = event {
                    let _ = tx.send(matches!(*err, ServiceError::Contract(_)));
                }
                Ok(())
            }
        });

        registry.subscribe(
            EventKind::Delete,
            Arc::new(|event: &Event| -> Result<Option<HandlerFuture>, BindingContractError> {
                let request = event.request().map(|r| r.routing_key.clone()).unwrap_or_default();
                Err(BindingContractError::IntentionMismatch {
                    action: EventKind::Update,
                    intention: "DELETE".to_string(),
                    routing_key: request,
                })
            }),
            false,
        );

        let outcome = dispatcher.dispatch(&Delivery::new(
            "foo.update",
            r#"{"msg_id": 1, "msg_intention": "DELETE"}"#,
        ));

        assert!(matches!(outcome, DispatchOutcome::ContractViolation { handlers: 0, .. }));
        let was_contract = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(was_contract);
    }

    #[tokio::test]
    async fn contract_violation_still_runs_sibling_listeners() {
        let (registry, dispatcher) = dispatcher();
        registry.subscribe(
            EventKind::Delete,
            Arc::new(|_: &Event| -> Result<Option<HandlerFuture>, BindingContractError> {
                Err(BindingContractError::IntentionMismatch {
                    action: EventKind::Update,
                    intention: "DELETE".to_string(),
                    routing_key: "foo.update".to_string(),
                })
            }),
            false,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.on(EventKind::Delete, move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
                Ok(())
            }
        });

        let outcome = dispatcher.dispatch(&Delivery::new(
            "foo.update",
            r#"{"msg_id": 1, "msg_intention": "DELETE"}"#,
        ));

        assert!(matches!(outcome, DispatchOutcome::ContractViolation { handlers: 1, .. }));
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_reach_domain_channels(body in proptest::collection::vec(any::<u8>(), 0..64)) {
            let (registry, dispatcher) = dispatcher();
            let counts = count_all(&registry);
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();

            let outcome = runtime.block_on(async { dispatcher.dispatch(&Delivery::new("k", body)) });

            if let DispatchOutcome::Emitted { kind, .. } = outcome {
                // Only bytes that happen to form a valid envelope get through.
                prop_assert_eq!(fired(&counts), vec![kind]);
            } else {
                prop_assert!(fired(&counts).is_empty());
            }
        }
    }
}
