//! # JSON Entity Serialiser
//!
//! Implements the entity serialiser contracts over `serde_json::Value`.
//!
//! Layout:
//! - an entity is a JSON array of positional fields;
//! - a components block is a JSON object keyed by the decimal component id;
//! - a real component is `[type, {"<key>": value, ...}]`;
//! - a view component is `{"view": value}`.

use serde_json::{Map, Value};
use spaces_shared::constants::keys::is_view_component;
use spaces_shared::error::SerialiserError;
use spaces_shared::serialiser::{EntityDeserialiser, EntitySerialiser, SerialiserResult};
use spaces_shared::types::{Vector3, Vector4};
use spaces_shared::value::ReplicatedValue;
use std::collections::BTreeMap;

use super::{describe, value_from_json, value_to_json};

const VIEW_FIELD: &str = "view";

enum WriteFrame {
    Entity(Vec<Value>),
    Array(Vec<Value>),
    Components(Map<String, Value>),
    Component {
        id: u16,
        component_type: u64,
        properties: Map<String, Value>,
    },
}

/// Builds one entity as a JSON value
#[derive(Default)]
pub struct JsonEntitySerialiser {
    stack: Vec<WriteFrame>,
    finished: Option<Value>,
}

impl JsonEntitySerialiser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the finished entity. Fails while frames are still open.
    pub fn into_value(self) -> SerialiserResult<Value> {
        if !self.stack.is_empty() {
            return Err(SerialiserError::InvalidState("entity not closed"));
        }
        self.finished.ok_or(SerialiserError::InvalidState("no entity written"))
    }

    fn push_value(&mut self, value: Value) -> SerialiserResult<()> {
        match self.stack.last_mut() {
            Some(WriteFrame::Entity(items)) | Some(WriteFrame::Array(items)) => {
                items.push(value);
                Ok(())
            }
            _ => Err(SerialiserError::InvalidState("values can only be written inside an entity or array")),
        }
    }

    fn components_mut(&mut self) -> SerialiserResult<&mut Map<String, Value>> {
        match self.stack.last_mut() {
            Some(WriteFrame::Components(map)) => Ok(map),
            _ => Err(SerialiserError::InvalidState("components not begun")),
        }
    }
}

impl EntitySerialiser for JsonEntitySerialiser {
    fn begin_entity(&mut self) -> SerialiserResult<()> {
        match self.stack.last() {
            None if self.finished.is_none() => {}
            Some(WriteFrame::Array(_)) => {}
            _ => return Err(SerialiserError::InvalidState("entity cannot begin here")),
        }
        self.stack.push(WriteFrame::Entity(Vec::new()));
        Ok(())
    }

    fn end_entity(&mut self) -> SerialiserResult<()> {
        match self.stack.pop() {
            Some(WriteFrame::Entity(items)) => {
                if self.stack.is_empty() {
                    self.finished = Some(Value::Array(items));
                    Ok(())
                } else {
                    self.push_value(Value::Array(items))
                }
            }
            _ => Err(SerialiserError::InvalidState("end_entity without begin_entity")),
        }
    }

    fn begin_array(&mut self) -> SerialiserResult<()> {
        match self.stack.last() {
            Some(WriteFrame::Entity(_)) | Some(WriteFrame::Array(_)) => {
                self.stack.push(WriteFrame::Array(Vec::new()));
                Ok(())
            }
            _ => Err(SerialiserError::InvalidState("array cannot begin here")),
        }
    }

    fn end_array(&mut self) -> SerialiserResult<()> {
        match self.stack.pop() {
            Some(WriteFrame::Array(items)) => self.push_value(Value::Array(items)),
            _ => Err(SerialiserError::InvalidState("end_array without begin_array")),
        }
    }

    fn begin_components(&mut self) -> SerialiserResult<()> {
        match self.stack.last() {
            Some(WriteFrame::Entity(_)) => {
                self.stack.push(WriteFrame::Components(Map::new()));
                Ok(())
            }
            _ => Err(SerialiserError::InvalidState("components must be inside an entity")),
        }
    }

    fn end_components(&mut self) -> SerialiserResult<()> {
        match self.stack.pop() {
            Some(WriteFrame::Components(map)) => self.push_value(Value::Object(map)),
            _ => Err(SerialiserError::InvalidState("end_components without begin_components")),
        }
    }

    fn begin_component(&mut self, id: u16, component_type: u64) -> SerialiserResult<()> {
        if is_view_component(id) {
            return Err(SerialiserError::InvalidState("component id is in the view range"));
        }
        self.components_mut()?;
        self.stack.push(WriteFrame::Component { id, component_type, properties: Map::new() });
        Ok(())
    }

    fn end_component(&mut self) -> SerialiserResult<()> {
        match self.stack.pop() {
            Some(WriteFrame::Component { id, component_type, properties }) => {
                let body = Value::Array(vec![Value::from(component_type), Value::Object(properties)]);
                self.components_mut()?.insert(id.to_string(), body);
                Ok(())
            }
            _ => Err(SerialiserError::InvalidState("end_component without begin_component")),
        }
    }

    fn write_bool(&mut self, value: bool) -> SerialiserResult<()> {
        self.push_value(Value::Bool(value))
    }

    fn write_byte(&mut self, value: u8) -> SerialiserResult<()> {
        self.push_value(Value::from(value))
    }

    fn write_double(&mut self, value: f64) -> SerialiserResult<()> {
        self.push_value(Value::from(value))
    }

    fn write_i64(&mut self, value: i64) -> SerialiserResult<()> {
        self.push_value(Value::from(value))
    }

    fn write_u64(&mut self, value: u64) -> SerialiserResult<()> {
        self.push_value(Value::from(value))
    }

    fn write_string(&mut self, value: &str) -> SerialiserResult<()> {
        self.push_value(Value::String(value.to_string()))
    }

    fn write_vector3(&mut self, value: Vector3) -> SerialiserResult<()> {
        let json = serde_json::to_value(value).map_err(|e| SerialiserError::Malformed(e.to_string()))?;
        self.push_value(json)
    }

    fn write_vector4(&mut self, value: Vector4) -> SerialiserResult<()> {
        let json = serde_json::to_value(value).map_err(|e| SerialiserError::Malformed(e.to_string()))?;
        self.push_value(json)
    }

    fn write_null(&mut self) -> SerialiserResult<()> {
        self.push_value(Value::Null)
    }

    fn write_property(&mut self, id: u64, value: &ReplicatedValue) -> SerialiserResult<()> {
        let json = value_to_json(value)?;
        match self.stack.last_mut() {
            Some(WriteFrame::Component { properties, .. }) => {
                properties.insert(id.to_string(), json);
                Ok(())
            }
            _ => Err(SerialiserError::InvalidState("properties can only be written inside a component")),
        }
    }

    fn add_view_component(&mut self, id: u16, value: &ReplicatedValue) -> SerialiserResult<()> {
        if !is_view_component(id) {
            return Err(SerialiserError::InvalidState("view component id is in the real range"));
        }
        let json = value_to_json(value)?;
        let mut body = Map::new();
        body.insert(VIEW_FIELD.to_string(), json);
        self.components_mut()?.insert(id.to_string(), Value::Object(body));
        Ok(())
    }
}

enum ReadFrame {
    Sequence {
        items: Vec<Value>,
        pos: usize,
        is_entity: bool,
    },
    Components {
        real: Vec<(u16, Value)>,
        pos: usize,
        total: usize,
    },
    Component {
        properties: Vec<(u64, Value)>,
        pos: usize,
    },
}

/// Reads one entity produced by [`JsonEntitySerialiser`]
pub struct JsonEntityDeserialiser {
    root: Option<Value>,
    stack: Vec<ReadFrame>,
    view: BTreeMap<u16, Value>,
}

impl JsonEntityDeserialiser {
    pub fn new(value: Value) -> Self {
        Self { root: Some(value), stack: Vec::new(), view: BTreeMap::new() }
    }

    fn next_raw(&mut self) -> SerialiserResult<Value> {
        match self.stack.last_mut() {
            Some(ReadFrame::Sequence { items, pos, .. }) => {
                let value = items.get_mut(*pos).ok_or(SerialiserError::UnexpectedEnd)?.take();
                *pos += 1;
                Ok(value)
            }
            _ => Err(SerialiserError::InvalidState("values can only be read inside an entity or array")),
        }
    }

    fn peek(&self) -> Option<&Value> {
        match self.stack.last() {
            Some(ReadFrame::Sequence { items, pos, .. }) => items.get(*pos),
            _ => None,
        }
    }

    fn components(&self) -> SerialiserResult<(&[(u16, Value)], usize)> {
        self.stack
            .iter()
            .rev()
            .find_map(|frame| match frame {
                ReadFrame::Components { real, total, .. } => Some((real.as_slice(), *total)),
                _ => None,
            })
            .ok_or(SerialiserError::InvalidState("components not entered"))
    }

    fn mismatch(expected: &'static str, found: &Value) -> SerialiserError {
        SerialiserError::TypeMismatch { expected, found: describe(found) }
    }
}

impl EntityDeserialiser for JsonEntityDeserialiser {
    fn enter_entity(&mut self) -> SerialiserResult<()> {
        let value = if self.stack.is_empty() {
            self.root.take().ok_or(SerialiserError::InvalidState("entity already read"))?
        } else {
            self.next_raw()?
        };
        match value {
            Value::Array(items) => {
                self.stack.push(ReadFrame::Sequence { items, pos: 0, is_entity: true });
                Ok(())
            }
            other => Err(Self::mismatch("entity array", &other)),
        }
    }

    fn leave_entity(&mut self) -> SerialiserResult<()> {
        match self.stack.pop() {
            Some(ReadFrame::Sequence { is_entity: true, .. }) => Ok(()),
            _ => Err(SerialiserError::InvalidState("leave_entity without enter_entity")),
        }
    }

    fn enter_array(&mut self) -> SerialiserResult<usize> {
        match self.next_raw()? {
            Value::Array(items) => {
                let len = items.len();
                self.stack.push(ReadFrame::Sequence { items, pos: 0, is_entity: false });
                Ok(len)
            }
            other => Err(Self::mismatch("array", &other)),
        }
    }

    fn leave_array(&mut self) -> SerialiserResult<()> {
        match self.stack.pop() {
            Some(ReadFrame::Sequence { is_entity: false, .. }) => Ok(()),
            _ => Err(SerialiserError::InvalidState("leave_array without enter_array")),
        }
    }

    fn enter_components(&mut self) -> SerialiserResult<()> {
        let map = match self.next_raw()? {
            Value::Object(map) => map,
            other => return Err(Self::mismatch("components object", &other)),
        };

        let total = map.len();
        let mut real = Vec::new();
        self.view.clear();

        for (key, body) in map {
            let id: u16 = key
                .parse()
                .map_err(|_| SerialiserError::Malformed(format!("component key '{}' is not a u16", key)))?;

            if is_view_component(id) {
                let value = match body {
                    Value::Object(mut fields) => fields.remove(VIEW_FIELD).unwrap_or(Value::Null),
                    other => return Err(Self::mismatch("view component object", &other)),
                };
                self.view.insert(id, value);
            } else {
                real.push((id, body));
            }
        }

        real.sort_by_key(|(id, _)| *id);
        self.stack.push(ReadFrame::Components { real, pos: 0, total });
        Ok(())
    }

    fn leave_components(&mut self) -> SerialiserResult<()> {
        match self.stack.pop() {
            Some(ReadFrame::Components { .. }) => {
                self.view.clear();
                Ok(())
            }
            _ => Err(SerialiserError::InvalidState("leave_components without enter_components")),
        }
    }

    fn enter_component(&mut self) -> SerialiserResult<(u16, u64)> {
        let (id, body) = match self.stack.last_mut() {
            Some(ReadFrame::Components { real, pos, .. }) => {
                let entry = real.get_mut(*pos).ok_or(SerialiserError::UnexpectedEnd)?;
                *pos += 1;
                (entry.0, entry.1.take())
            }
            _ => return Err(SerialiserError::InvalidState("enter_component outside components")),
        };

        let mut parts = match body {
            Value::Array(parts) if parts.len() == 2 => parts,
            other => return Err(Self::mismatch("[type, properties]", &other)),
        };
        let properties = parts.pop().unwrap_or(Value::Null);
        let component_type = parts[0].as_u64().ok_or_else(|| Self::mismatch("component type", &parts[0]))?;

        let mut properties: Vec<(u64, Value)> = match properties {
            Value::Object(map) => map
                .into_iter()
                .map(|(key, value)| {
                    key.parse::<u64>()
                        .map(|k| (k, value))
                        .map_err(|_| SerialiserError::Malformed(format!("property key '{}' is not a u64", key)))
                })
                .collect::<Result<_, _>>()?,
            other => return Err(Self::mismatch("properties object", &other)),
        };
        properties.sort_by_key(|(key, _)| *key);

        self.stack.push(ReadFrame::Component { properties, pos: 0 });
        Ok((id, component_type))
    }

    fn leave_component(&mut self) -> SerialiserResult<()> {
        match self.stack.pop() {
            Some(ReadFrame::Component { .. }) => Ok(()),
            _ => Err(SerialiserError::InvalidState("leave_component without enter_component")),
        }
    }

    fn read_bool(&mut self) -> SerialiserResult<bool> {
        let value = self.next_raw()?;
        value.as_bool().ok_or_else(|| Self::mismatch("bool", &value))
    }

    fn read_byte(&mut self) -> SerialiserResult<u8> {
        let value = self.next_raw()?;
        value
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| Self::mismatch("byte", &value))
    }

    fn read_double(&mut self) -> SerialiserResult<f64> {
        let value = self.next_raw()?;
        value.as_f64().ok_or_else(|| Self::mismatch("double", &value))
    }

    fn read_i64(&mut self) -> SerialiserResult<i64> {
        let value = self.next_raw()?;
        value.as_i64().ok_or_else(|| Self::mismatch("i64", &value))
    }

    fn read_u64(&mut self) -> SerialiserResult<u64> {
        let value = self.next_raw()?;
        value.as_u64().ok_or_else(|| Self::mismatch("u64", &value))
    }

    fn read_string(&mut self) -> SerialiserResult<String> {
        match self.next_raw()? {
            Value::String(s) => Ok(s),
            other => Err(Self::mismatch("string", &other)),
        }
    }

    fn read_vector3(&mut self) -> SerialiserResult<Vector3> {
        let value = self.next_raw()?;
        let found = describe(&value);
        serde_json::from_value(value).map_err(|_| SerialiserError::TypeMismatch { expected: "vector3", found })
    }

    fn read_vector4(&mut self) -> SerialiserResult<Vector4> {
        let value = self.next_raw()?;
        let found = describe(&value);
        serde_json::from_value(value).map_err(|_| SerialiserError::TypeMismatch { expected: "vector4", found })
    }

    fn next_value_is_null(&self) -> bool {
        matches!(self.peek(), Some(Value::Null))
    }

    fn next_value_is_array(&self) -> bool {
        matches!(self.peek(), Some(Value::Array(_)))
    }

    fn skip(&mut self) -> SerialiserResult<()> {
        self.next_raw().map(|_| ())
    }

    fn num_components(&self) -> SerialiserResult<usize> {
        self.components().map(|(_, total)| total)
    }

    fn num_real_components(&self) -> SerialiserResult<usize> {
        self.components().map(|(real, _)| real.len())
    }

    fn num_properties(&self) -> SerialiserResult<usize> {
        match self.stack.last() {
            Some(ReadFrame::Component { properties, .. }) => Ok(properties.len()),
            _ => Err(SerialiserError::InvalidState("component not entered")),
        }
    }

    fn read_property(&mut self) -> SerialiserResult<(u64, ReplicatedValue)> {
        let (key, raw) = match self.stack.last_mut() {
            Some(ReadFrame::Component { properties, pos }) => {
                let entry = properties.get_mut(*pos).ok_or(SerialiserError::UnexpectedEnd)?;
                *pos += 1;
                (entry.0, entry.1.take())
            }
            _ => return Err(SerialiserError::InvalidState("component not entered")),
        };
        Ok((key, value_from_json(raw)?))
    }

    fn has_view_component(&self, id: u16) -> bool {
        self.view.contains_key(&id)
    }

    fn get_view_component(&self, id: u16) -> Option<ReplicatedValue> {
        self.view.get(&id).cloned().and_then(|raw| value_from_json(raw).ok())
    }
}
