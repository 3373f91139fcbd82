//! # Serialization
//!
//! Conversion between [`ReplicatedValue`] and JSON, and the JSON implementation of
//! the entity serialiser contracts used on the wire.

pub mod json;

pub use json::{JsonEntityDeserialiser, JsonEntitySerialiser};

use serde_json::Value;
use spaces_shared::error::SerialiserError;
use spaces_shared::value::ReplicatedValue;

/// Serialize a replicated value to its tagged JSON form
pub(crate) fn value_to_json(value: &ReplicatedValue) -> Result<Value, SerialiserError> {
    serde_json::to_value(value).map_err(|e| SerialiserError::Malformed(format!("Failed to serialize value: {}", e)))
}

/// Deserialize a replicated value from its tagged JSON form
pub(crate) fn value_from_json(json: Value) -> Result<ReplicatedValue, SerialiserError> {
    serde_json::from_value(json).map_err(|e| SerialiserError::Malformed(format!("Failed to parse value: {}", e)))
}

/// Extract an unsigned integer from a response value.
/// Accepts a bare number or a single-element array holding one.
pub fn parse_u64(json: &Value) -> Option<u64> {
    match json {
        Value::Number(n) => n.as_u64(),
        Value::Array(items) if items.len() == 1 => parse_u64(&items[0]),
        _ => None,
    }
}

pub(crate) fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(a) => format!("array[{}]", a.len()),
        Value::Object(_) => "object".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spaces_shared::types::Vector3;

    #[test]
    fn vector_survives_the_tagged_form() {
        let value = ReplicatedValue::from(Vector3::new(0.5, 1.0, 2.0));
        let json = value_to_json(&value).unwrap();
        assert_eq!(json["type"], json!("Vector3"));
        assert_eq!(value_from_json(json).unwrap(), value);
    }

    #[test]
    fn rejects_untagged_values() {
        assert!(value_from_json(json!(5)).is_err());
        assert!(value_from_json(json!({"a": 1})).is_err());
    }

    #[test]
    fn parses_ids_in_either_shape() {
        assert_eq!(parse_u64(&json!(42)), Some(42));
        assert_eq!(parse_u64(&json!([42])), Some(42));
        assert_eq!(parse_u64(&json!("42")), None);
    }
}
