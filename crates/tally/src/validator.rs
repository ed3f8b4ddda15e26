//! Message body validation.
//!
//! A message body must be a JSON object carrying a string `type` and a
//! numeric `value`. Numbers may also arrive as strings (`"12.5"`). Extra
//! fields are ignored so producers can add to the schema freely.

use serde_json::{Map, Value};
use snafu::Snafu;

/// A validated business event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event type used as the aggregation key. May be empty.
    pub event_type: String,
    /// The value, normalized to `f64`.
    pub value: f64,
}

/// Coarse classification of a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailureKind {
    MalformedPayload,
    SchemaViolation,
}

impl ValidationFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationFailureKind::MalformedPayload => "malformed_payload",
            ValidationFailureKind::SchemaViolation => "schema_violation",
        }
    }
}

/// A single offending field and why it was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: &'static str,
    pub reason: &'static str,
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.field, self.reason)
    }
}

/// Why a message body was rejected.
///
/// Both variants are permanent: the same body can never validate.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum ValidationError {
    /// The body is not a JSON object.
    #[snafu(display("Malformed payload: {detail}"))]
    MalformedPayload { detail: String },

    /// The body is an object but required fields are missing or mistyped.
    #[snafu(display("Schema violation: {}", format_violations(violations)))]
    SchemaViolation { violations: Vec<FieldViolation> },
}

impl ValidationError {
    pub fn kind(&self) -> ValidationFailureKind {
        match self {
            ValidationError::MalformedPayload { .. } => ValidationFailureKind::MalformedPayload,
            ValidationError::SchemaViolation { .. } => ValidationFailureKind::SchemaViolation,
        }
    }

    /// Names of the offending fields; empty for malformed payloads.
    pub fn fields(&self) -> Vec<&'static str> {
        match self {
            ValidationError::MalformedPayload { .. } => Vec::new(),
            ValidationError::SchemaViolation { violations } => {
                violations.iter().map(|v| v.field).collect()
            }
        }
    }
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validate a raw message body.
pub fn validate(raw: &[u8]) -> Result<Event, ValidationError> {
    let document: Value = serde_json::from_slice(raw).map_err(|e| {
        ValidationError::MalformedPayload {
            detail: e.to_string(),
        }
    })?;

    let Value::Object(fields) = document else {
        return MalformedPayloadSnafu {
            detail: format!("expected a JSON object, found {}", json_kind(&document)),
        }
        .fail();
    };

    let mut violations = Vec::new();
    let event_type = check_type(&fields, &mut violations);
    let value = check_value(&fields, &mut violations);

    match (event_type, value) {
        (Some(event_type), Some(value)) if violations.is_empty() => {
            Ok(Event { event_type, value })
        }
        _ => SchemaViolationSnafu { violations }.fail(),
    }
}

fn check_type(
    fields: &Map<String, Value>,
    violations: &mut Vec<FieldViolation>,
) -> Option<String> {
    match fields.get("type") {
        Some(Value::String(s)) => Some(s.clone()),
        None => {
            violations.push(FieldViolation {
                field: "type",
                reason: "is required",
            });
            None
        }
        Some(_) => {
            violations.push(FieldViolation {
                field: "type",
                reason: "must be a string",
            });
            None
        }
    }
}

fn check_value(
    fields: &Map<String, Value>,
    violations: &mut Vec<FieldViolation>,
) -> Option<f64> {
    let reason = match fields.get("value") {
        None => "is required",
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() => return Some(v),
            _ => "must be a finite number",
        },
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => return Some(v),
            _ => "must be a number or numeric string",
        },
        Some(_) => "must be a number or numeric string",
    };

    violations.push(FieldViolation {
        field: "value",
        reason,
    });
    None
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_fields(raw: &str) -> Vec<&'static str> {
        let err = validate(raw.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ValidationFailureKind::SchemaViolation, "{err}");
        err.fields()
    }

    #[test]
    fn test_valid_event() {
        let event = validate(br#"{"type": "signup", "value": 25.5}"#).unwrap();
        assert_eq!(
            event,
            Event {
                event_type: "signup".to_string(),
                value: 25.5
            }
        );
    }

    #[test]
    fn test_integer_value_normalized() {
        let event = validate(br#"{"type": "login", "value": 10}"#).unwrap();
        assert_eq!(event.value, 10.0);
    }

    #[test]
    fn test_numeric_string_value() {
        let event = validate(br#"{"type": "view", "value": " 3.25 "}"#).unwrap();
        assert_eq!(event.value, 3.25);

        let event = validate(br#"{"type": "view", "value": "-7"}"#).unwrap();
        assert_eq!(event.value, -7.0);
    }

    #[test]
    fn test_empty_type_is_valid() {
        let event = validate(br#"{"type": "", "value": 1}"#).unwrap();
        assert_eq!(event.event_type, "");
    }

    #[test]
    fn test_extra_fields_ignored() {
        let event =
            validate(br#"{"type":"click","value":2,"user":"u-1","meta":{"a":1}}"#).unwrap();
        assert_eq!(event.event_type, "click");
        assert_eq!(event.value, 2.0);
    }

    #[test]
    fn test_unparseable_body_is_malformed() {
        let err = validate(b"not-json").unwrap_err();
        assert_eq!(err.kind(), ValidationFailureKind::MalformedPayload);
        assert!(err.fields().is_empty());
    }

    #[test]
    fn test_non_object_document_is_malformed() {
        for raw in ["\"not-json\"", "[1, 2]", "42", "null"] {
            let err = validate(raw.as_bytes()).unwrap_err();
            assert_eq!(err.kind(), ValidationFailureKind::MalformedPayload, "{raw}");
        }
    }

    #[test]
    fn test_missing_both_fields_lists_both() {
        assert_eq!(schema_fields(r#"{"invalid": "schema"}"#), vec!["type", "value"]);
    }

    #[test]
    fn test_missing_value() {
        assert_eq!(schema_fields(r#"{"type": "signup"}"#), vec!["value"]);
    }

    #[test]
    fn test_wrong_type_field() {
        assert_eq!(schema_fields(r#"{"type": 5, "value": 1}"#), vec!["type"]);
    }

    #[test]
    fn test_rejected_values() {
        for value in [r#""abc""#, "true", "null", r#""NaN""#, r#""inf""#, "[1]", r#""""#] {
            let raw = format!(r#"{{"type": "t", "value": {value}}}"#);
            assert_eq!(schema_fields(&raw), vec!["value"], "value {value}");
        }
    }

    #[test]
    fn test_error_display_includes_detail() {
        let err = validate(br#"{"type": "t", "value": "abc"}"#).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Schema violation: value must be a number or numeric string"
        );
    }
}
