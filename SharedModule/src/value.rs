//! # Replicated Values
//!
//! `ReplicatedValue` is the single value type carried by component properties,
//! view components and network event arguments. Exactly one variant is active at a
//! time; typed accessors refuse to read a variant other than the active one.

use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ValueTypeError;
use crate::types::{Vector2, Vector3, Vector4};

/// Discriminant of a [`ReplicatedValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicatedValueType {
    Boolean,
    Integer,
    Float,
    String,
    Vector2,
    Vector3,
    Vector4,
    StringMap,
}

/// Tagged wire value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ReplicatedValue {
    Boolean(bool),
    Integer(i64),
    Float(f32),
    String(String),
    Vector2(Vector2),
    Vector3(Vector3),
    Vector4(Vector4),
    StringMap(BTreeMap<String, ReplicatedValue>),
}

impl ReplicatedValue {
    /// Get the type of the active variant
    pub fn get_type(&self) -> ReplicatedValueType {
        match self {
            Self::Boolean(_) => ReplicatedValueType::Boolean,
            Self::Integer(_) => ReplicatedValueType::Integer,
            Self::Float(_) => ReplicatedValueType::Float,
            Self::String(_) => ReplicatedValueType::String,
            Self::Vector2(_) => ReplicatedValueType::Vector2,
            Self::Vector3(_) => ReplicatedValueType::Vector3,
            Self::Vector4(_) => ReplicatedValueType::Vector4,
            Self::StringMap(_) => ReplicatedValueType::StringMap,
        }
    }

    fn mismatch(&self, expected: ReplicatedValueType) -> ValueTypeError {
        ValueTypeError { expected, actual: self.get_type() }
    }

    pub fn get_bool(&self) -> Result<bool, ValueTypeError> {
        match self {
            Self::Boolean(b) => Ok(*b),
            _ => Err(self.mismatch(ReplicatedValueType::Boolean)),
        }
    }

    pub fn get_int(&self) -> Result<i64, ValueTypeError> {
        match self {
            Self::Integer(i) => Ok(*i),
            _ => Err(self.mismatch(ReplicatedValueType::Integer)),
        }
    }

    pub fn get_float(&self) -> Result<f32, ValueTypeError> {
        match self {
            Self::Float(f) => Ok(*f),
            _ => Err(self.mismatch(ReplicatedValueType::Float)),
        }
    }

    pub fn get_string(&self) -> Result<&str, ValueTypeError> {
        match self {
            Self::String(s) => Ok(s),
            _ => Err(self.mismatch(ReplicatedValueType::String)),
        }
    }

    pub fn get_vector2(&self) -> Result<Vector2, ValueTypeError> {
        match self {
            Self::Vector2(v) => Ok(*v),
            _ => Err(self.mismatch(ReplicatedValueType::Vector2)),
        }
    }

    pub fn get_vector3(&self) -> Result<Vector3, ValueTypeError> {
        match self {
            Self::Vector3(v) => Ok(*v),
            _ => Err(self.mismatch(ReplicatedValueType::Vector3)),
        }
    }

    pub fn get_vector4(&self) -> Result<Vector4, ValueTypeError> {
        match self {
            Self::Vector4(v) => Ok(*v),
            _ => Err(self.mismatch(ReplicatedValueType::Vector4)),
        }
    }

    pub fn get_string_map(&self) -> Result<&BTreeMap<String, ReplicatedValue>, ValueTypeError> {
        match self {
            Self::StringMap(m) => Ok(m),
            _ => Err(self.mismatch(ReplicatedValueType::StringMap)),
        }
    }
}

impl From<bool> for ReplicatedValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for ReplicatedValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f32> for ReplicatedValue {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<String> for ReplicatedValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for ReplicatedValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<Vector2> for ReplicatedValue {
    fn from(value: Vector2) -> Self {
        Self::Vector2(value)
    }
}

impl From<Vector3> for ReplicatedValue {
    fn from(value: Vector3) -> Self {
        Self::Vector3(value)
    }
}

impl From<Vector4> for ReplicatedValue {
    fn from(value: Vector4) -> Self {
        Self::Vector4(value)
    }
}

impl From<BTreeMap<String, ReplicatedValue>> for ReplicatedValue {
    fn from(value: BTreeMap<String, ReplicatedValue>) -> Self {
        Self::StringMap(value)
    }
}

impl fmt::Display for ReplicatedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(s) => write!(f, "{}", s),
            Self::Vector2(v) => write!(f, "(X={},Y={})", v.x, v.y),
            Self::Vector3(v) => write!(f, "(X={},Y={},Z={})", v.x, v.y, v.z),
            Self::Vector4(v) => write!(f, "(X={},Y={},Z={},W={})", v.x, v.y, v.z, v.w),
            Self::StringMap(m) => {
                write!(f, "{{")?;
                for (i, (key, value)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}={}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accessor_matches_active_variant() {
        let value = ReplicatedValue::from(Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(value.get_type(), ReplicatedValueType::Vector3);
        assert_eq!(value.get_vector3().unwrap(), Vector3::new(1.0, 2.0, 3.0));

        let err = value.get_int().unwrap_err();
        assert_eq!(err.expected, ReplicatedValueType::Integer);
        assert_eq!(err.actual, ReplicatedValueType::Vector3);
    }

    #[test]
    fn equality_compares_type_before_value() {
        assert_ne!(ReplicatedValue::Integer(1), ReplicatedValue::Float(1.0));
        assert_ne!(ReplicatedValue::Boolean(false), ReplicatedValue::Integer(0));
        assert_eq!(ReplicatedValue::from("a"), ReplicatedValue::String("a".to_string()));
    }

    #[test]
    fn clone_keeps_nested_payload() {
        let mut inner = BTreeMap::new();
        inner.insert("speed".to_string(), ReplicatedValue::Float(2.5));
        inner.insert("label".to_string(), ReplicatedValue::from("fast"));
        let value = ReplicatedValue::StringMap(inner);

        let copy = value.clone();
        drop(value);
        let map = copy.get_string_map().unwrap();
        assert_eq!(map["label"].get_string().unwrap(), "fast");
    }

    #[test]
    fn serde_form_is_tagged() {
        let json = serde_json::to_value(ReplicatedValue::Integer(7)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "Integer", "value": 7}));
    }

    fn arb_value() -> impl Strategy<Value = ReplicatedValue> {
        let leaf = prop_oneof![
            any::<bool>().prop_map(ReplicatedValue::Boolean),
            any::<i64>().prop_map(ReplicatedValue::Integer),
            (-1.0e6f32..1.0e6f32).prop_map(ReplicatedValue::Float),
            ".{0,12}".prop_map(ReplicatedValue::String),
            (-1.0e3f32..1.0e3f32, -1.0e3f32..1.0e3f32, -1.0e3f32..1.0e3f32)
                .prop_map(|(x, y, z)| ReplicatedValue::Vector3(Vector3::new(x, y, z))),
        ];
        leaf.prop_recursive(2, 8, 4, |inner| {
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(ReplicatedValue::StringMap)
        })
    }

    proptest! {
        #[test]
        fn json_form_preserves_variant(value in arb_value()) {
            let json = serde_json::to_string(&value).unwrap();
            let back: ReplicatedValue = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back.get_type(), value.get_type());
            prop_assert_eq!(back, value);
        }
    }
}
