//! JSON envelopes exchanged over the broker.
//!
//! Field names match the wire format exactly (`msg_id`, `msg_intention`,
//! `userID`), so none of these structs use a `rename_all` policy.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::intention::Intention;

/// Status codes carried in the `status` field.
pub mod status {
    pub const OK: i64 = 200;
    pub const CREATED: i64 = 201;
    pub const BAD_REQUEST: i64 = 400;
    pub const NOT_FOUND: i64 = 404;
    pub const SERVER_ERROR: i64 = 500;
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A request decoded from a delivery body.
///
/// Only produced after the raw value passed structural validation. Domain
/// fields that are not part of the envelope are kept in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub msg_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_intention: Option<String>,
    /// Absent and `null` both decode as 0.
    #[serde(default, deserialize_with = "null_as_zero")]
    pub status: i64,
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

fn null_as_zero<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<i64>::deserialize(deserializer)?.unwrap_or_default())
}

impl InboundMessage {
    /// Classified intention of this request.
    #[must_use]
    pub fn intention(&self) -> Intention {
        Intention::from_wire(self.msg_intention.as_deref())
    }

    /// Looks up a domain field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// A domain reply correlated to the request it answers.
///
/// `result` holds identifiers for mutations and representations for reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundResponse {
    pub msg_id: i64,
    pub msg_intention: String,
    pub status: i64,
    pub result: Vec<Value>,
}

impl OutboundResponse {
    #[must_use]
    pub fn new(msg_id: i64, msg_intention: impl Into<String>, status: i64, result: Vec<Value>) -> Self {
        Self {
            msg_id,
            msg_intention: msg_intention.into(),
            status,
            result,
        }
    }

    /// Renders the reply as a JSON object.
    #[must_use]
    pub fn into_value(self) -> Value {
        json!({
            "msg_id": self.msg_id,
            "msg_intention": self.msg_intention,
            "status": self.status,
            "result": self.result,
        })
    }
}

/// Minimal reply substituted when a domain reply fails validation.
///
/// Always valid by construction: it carries nothing but the correlation
/// fields and a server-error status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub msg_id: i64,
    pub msg_intention: String,
    pub status: i64,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn server_error(msg_id: i64, msg_intention: impl Into<String>) -> Self {
        Self {
            msg_id,
            msg_intention: msg_intention.into(),
            status: status::SERVER_ERROR,
        }
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        json!({
            "msg_id": self.msg_id,
            "msg_intention": self.msg_intention,
            "status": self.status,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
