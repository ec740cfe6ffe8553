use serde_json::Value;

/// JSON type a schema field must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Integral and representable as `i64`.
    Integer,
    String,
    Array,
    Object,
    /// Presence only; any JSON type is accepted.
    Any,
}

impl FieldKind {
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::Integer => value.as_i64().is_some(),
            Self::String => value.is_string(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

/// Single field definition within an envelope schema.
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Name of the field on the wire.
    pub name: String,
    /// Expected JSON type when the field is present.
    pub kind: FieldKind,
    /// Whether the field must be present.
    pub required: bool,
}

impl FieldDef {
    #[must_use]
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    #[must_use]
    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Result of validating a value against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// The value conforms to the schema.
    Valid,
    /// The value violates one or more schema constraints.
    Invalid {
        /// Human-readable descriptions of each validation failure.
        errors: Vec<String>,
    },
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Structural check applied to a parsed envelope before it is trusted.
///
/// The dispatcher is given one for inbound requests and the publisher one
/// for outbound replies. Closures with the matching signature implement the
/// trait, which keeps ad-hoc validators in tests short.
pub trait EnvelopeValidator: Send + Sync {
    fn validate(&self, value: &Value) -> ValidationResult;
}

impl<F> EnvelopeValidator for F
where
    F: Fn(&Value) -> ValidationResult + Send + Sync,
{
    fn validate(&self, value: &Value) -> ValidationResult {
        self(value)
    }
}

/// Field-list schema for a JSON object envelope.
///
/// Unlisted fields are always allowed, so domain payloads can grow without
/// touching the schema.
#[derive(Debug, Clone)]
pub struct EnvelopeSchema {
    pub fields: Vec<FieldDef>,
}

impl EnvelopeSchema {
    #[must_use]
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    /// Default shape of an inbound request.
    #[must_use]
    pub fn incoming() -> Self {
        Self::new(vec![
            FieldDef::required("msg_id", FieldKind::Integer),
            FieldDef::optional("msg_intention", FieldKind::String),
            FieldDef::optional("status", FieldKind::Integer),
            FieldDef::optional("userID", FieldKind::String),
        ])
    }

    /// Default shape of an outbound reply.
    #[must_use]
    pub fn outgoing() -> Self {
        Self::new(vec![
            FieldDef::required("msg_id", FieldKind::Integer),
            FieldDef::required("msg_intention", FieldKind::String),
            FieldDef::required("status", FieldKind::Integer),
            FieldDef::required("result", FieldKind::Array),
        ])
    }
}

impl EnvelopeValidator for EnvelopeSchema {
    fn validate(&self, value: &Value) -> ValidationResult {
        let Some(object) = value.as_object() else {
            return ValidationResult::Invalid {
                errors: vec!["envelope must be a JSON object".to_string()],
            };
        };

        let mut errors = Vec::new();
        for field in &self.fields {
            match object.get(&field.name) {
                // An explicit null counts as absent.
                None | Some(Value::Null) => {
                    if field.required {
                        errors.push(format!("missing required field `{}`", field.name));
                    }
                }
                Some(present) if !field.kind.matches(present) => {
                    errors.push(format!(
                        "field `{}` must be {}",
                        field.name,
                        field.kind.as_str()
                    ));
                }
                Some(_) => {}
            }
        }

        if errors.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid { errors }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn incoming_accepts_minimal_request() {
        let schema = EnvelopeSchema::incoming();
        assert!(schema.validate(&json!({"msg_id": 1})).is_valid());
        assert!(schema
            .validate(&json!({"msg_id": 1, "msg_intention": "READ", "status": 0, "userID": "u", "extra": [1]}))
            .is_valid());
    }

    #[test]
    fn incoming_rejects_missing_or_mistyped_id() {
        let schema = EnvelopeSchema::incoming();
        assert!(!schema.validate(&json!({"msg_intention": "READ"})).is_valid());
        assert!(!schema.validate(&json!({"msg_id": "1"})).is_valid());
        assert!(!schema.validate(&json!({"msg_id": 1.5})).is_valid());
        assert!(!schema.validate(&json!({"msg_id": null})).is_valid());
    }

    #[test]
    fn incoming_rejects_ids_beyond_i64() {
        let schema = EnvelopeSchema::incoming();
        let too_big: Value = serde_json::from_str(r#"{"msg_id": 9223372036854775808}"#).unwrap();
        assert_eq!(
            schema.validate(&too_big),
            ValidationResult::Invalid {
                errors: vec!["field `msg_id` must be integer".to_string()]
            }
        );
        assert!(schema.validate(&json!({"msg_id": i64::MAX})).is_valid());
        assert!(!schema.validate(&json!({"msg_id": 1, "status": u64::MAX})).is_valid());
    }

    #[test]
    fn incoming_accepts_null_status() {
        let schema = EnvelopeSchema::incoming();
        assert!(schema
            .validate(&json!({"msg_id": 1, "msg_intention": "READ", "status": null}))
            .is_valid());
    }

    #[test]
    fn incoming_rejects_mistyped_optional_fields() {
        let schema = EnvelopeSchema::incoming();
        assert!(!schema.validate(&json!({"msg_id": 1, "msg_intention": 4})).is_valid());
        assert!(!schema.validate(&json!({"msg_id": 1, "status": "ok"})).is_valid());
    }

    #[test]
    fn non_objects_are_invalid() {
        let schema = EnvelopeSchema::incoming();
        for value in [json!(null), json!(1), json!("x"), json!([1, 2])] {
            assert!(!schema.validate(&value).is_valid());
        }
    }

    #[test]
    fn outgoing_requires_result_array() {
        let schema = EnvelopeSchema::outgoing();
        assert!(schema
            .validate(&json!({"msg_id": 1, "msg_intention": "READ", "status": 200, "result": []}))
            .is_valid());

        let result = schema.validate(&json!({"msg_id": 1, "msg_intention": "READ", "status": 200, "result": {}}));
        assert_eq!(
            result,
            ValidationResult::Invalid {
                errors: vec!["field `result` must be array".to_string()]
            }
        );
    }

    #[test]
    fn outgoing_reports_every_failure() {
        let schema = EnvelopeSchema::outgoing();
        let ValidationResult::Invalid { errors } = schema.validate(&json!({})) else {
            panic!("empty object must be invalid");
        };
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn closures_are_validators() {
        let reject_all = |_: &Value| ValidationResult::Invalid {
            errors: vec!["nope".to_string()],
        };
        assert!(!reject_all.validate(&json!({"msg_id": 1})).is_valid());
    }

    proptest! {
        #[test]
        fn any_integer_id_is_accepted(id in any::<i64>()) {
            let valid = EnvelopeSchema::incoming().validate(&json!({"msg_id": id})).is_valid();
            prop_assert!(valid);
        }

        #[test]
        fn string_ids_are_rejected(id in "[a-z0-9]{0,12}") {
            let valid = EnvelopeSchema::incoming().validate(&json!({"msg_id": id})).is_valid();
            prop_assert!(!valid);
        }
    }
}
