use crate::broker::ConnectionError;

use super::events::EventKind;

/// A delivery that could not be turned into a typed request.
///
/// Never fatal: the delivery is dropped with a log entry, no reply is sent,
/// and no event is emitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("delivery body is not valid JSON: {0}")]
    Malformed(String),
    #[error("inbound envelope failed validation: {}", errors.join("; "))]
    Invalid { errors: Vec<String> },
    #[error("inbound envelope could not be decoded: {0}")]
    Undecodable(String),
}

/// A routing binder received a message whose declared intention does not
/// agree with the action it was bound to.
///
/// This is a wiring bug, not a runtime condition, and is raised
/// synchronously by the listener instead of being swallowed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingContractError {
    #[error("handler bound to `{action}` on `{routing_key}` received a `{intention}` message")]
    IntentionMismatch {
        action: EventKind,
        intention: String,
        routing_key: String,
    },
}

/// Everything reported through the `error` event.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("{kind} handler failed (msg_id {msg_id:?}): {cause:#}")]
    Handler {
        kind: EventKind,
        msg_id: Option<i64>,
        cause: anyhow::Error,
    },
    #[error(transparent)]
    Contract(#[from] BindingContractError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_joins_all_errors() {
        let err = ProtocolError::Invalid {
            errors: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "inbound envelope failed validation: a; b");
    }

    #[test]
    fn contract_error_names_both_sides() {
        let err = BindingContractError::IntentionMismatch {
            action: EventKind::Update,
            intention: "DELETE".to_string(),
            routing_key: "foo.update".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "handler bound to `update` on `foo.update` received a `DELETE` message"
        );
    }

    #[test]
    fn handler_error_includes_cause_chain() {
        let cause = anyhow::anyhow!("row locked").context("update failed");
        let err = ServiceError::Handler {
            kind: EventKind::Update,
            msg_id: Some(4),
            cause,
        };
        assert_eq!(
            err.to_string(),
            "update handler failed (msg_id Some(4)): update failed: row locked"
        );
    }
}
