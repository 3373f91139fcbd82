//! # Entity Wire Messages
//!
//! Full snapshots (`ObjectMessage`) and incremental changes (`ObjectPatch`),
//! encoded through the entity serialiser contracts.
//!
//! Snapshot field order: id, type, transferable, persistent, owner, parent|null, components.
//! Patch field order: id, owner, destroy, parent changed, parent|null, components.
//! A deleted component is written with type [`COMPONENT_TYPE_DELETE`] and no properties.

use serde_json::Value;
use spaces_shared::constants::keys::*;
use spaces_shared::entity::{ComponentType, SpaceEntityType};
use spaces_shared::error::SerialiserError;
use spaces_shared::serialiser::{EntityDeserialiser, EntitySerialiser, SerialiserResult};
use spaces_shared::types::{ClientId, EntityId};
use spaces_shared::value::ReplicatedValue;
use std::collections::BTreeMap;

use super::component::Component;
use crate::serialization::{JsonEntityDeserialiser, JsonEntitySerialiser};

/// View keys understood by this client
pub const VIEW_KEYS: [u16; 6] = [
    COMPONENT_KEY_VIEW_ENTITY_NAME,
    COMPONENT_KEY_VIEW_POSITION,
    COMPONENT_KEY_VIEW_ROTATION,
    COMPONENT_KEY_VIEW_SCALE,
    COMPONENT_KEY_VIEW_SELECTED_CLIENT_ID,
    COMPONENT_KEY_VIEW_LOCK_TYPE,
];

/// Full state of one entity
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMessage {
    pub id: EntityId,
    pub entity_type: SpaceEntityType,
    pub is_transferable: bool,
    pub is_persistent: bool,
    pub owner_id: ClientId,
    pub parent_id: Option<EntityId>,
    pub components: BTreeMap<u16, Component>,
    pub view: BTreeMap<u16, ReplicatedValue>,
}

/// Change to one component inside a patch
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentPatch {
    Upsert(Component),
    Delete,
}

/// Incremental change to one entity
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPatch {
    pub id: EntityId,
    pub owner_id: ClientId,
    pub destroy: bool,
    /// `None` leaves the parent unchanged; `Some(None)` clears it
    pub parent: Option<Option<EntityId>>,
    pub components: BTreeMap<u16, ComponentPatch>,
    pub view: BTreeMap<u16, ReplicatedValue>,
}

impl ObjectPatch {
    pub fn new(id: EntityId, owner_id: ClientId) -> Self {
        Self { id, owner_id, destroy: false, parent: None, components: BTreeMap::new(), view: BTreeMap::new() }
    }

    pub fn destroy(id: EntityId, owner_id: ClientId) -> Self {
        Self { destroy: true, ..Self::new(id, owner_id) }
    }

    pub fn serialise<S: EntitySerialiser + ?Sized>(&self, writer: &mut S) -> SerialiserResult<()> {
        writer.begin_entity()?;
        writer.write_u64(self.id)?;
        writer.write_u64(self.owner_id)?;
        writer.write_bool(self.destroy)?;
        writer.write_bool(self.parent.is_some())?;
        write_optional_u64(writer, self.parent.flatten())?;

        writer.begin_components()?;
        for (id, change) in &self.components {
            match change {
                ComponentPatch::Upsert(component) => component.write(writer)?,
                ComponentPatch::Delete => {
                    writer.begin_component(*id, COMPONENT_TYPE_DELETE)?;
                    writer.end_component()?;
                }
            }
        }
        write_view(writer, &self.view)?;
        writer.end_components()?;

        writer.end_entity()
    }

    pub fn deserialise<D: EntityDeserialiser + ?Sized>(reader: &mut D) -> SerialiserResult<Self> {
        reader.enter_entity()?;
        let id = reader.read_u64()?;
        let owner_id = reader.read_u64()?;
        let destroy = reader.read_bool()?;
        let parent_changed = reader.read_bool()?;
        let parent_id = read_optional_u64(reader)?;

        reader.enter_components()?;
        let mut components = BTreeMap::new();
        for _ in 0..reader.num_real_components()? {
            let (component_id, raw_type) = reader.enter_component()?;
            let change = if raw_type == COMPONENT_TYPE_DELETE {
                ComponentPatch::Delete
            } else {
                ComponentPatch::Upsert(Component::read_entered(reader, component_id, ComponentType::from_raw(raw_type))?)
            };
            reader.leave_component()?;
            components.insert(component_id, change);
        }
        let view = read_view(reader);
        reader.leave_components()?;
        reader.leave_entity()?;

        Ok(Self { id, owner_id, destroy, parent: parent_changed.then_some(parent_id), components, view })
    }

    pub fn to_json(&self) -> SerialiserResult<Value> {
        let mut writer = JsonEntitySerialiser::new();
        self.serialise(&mut writer)?;
        writer.into_value()
    }

    pub fn from_json(value: Value) -> SerialiserResult<Self> {
        Self::deserialise(&mut JsonEntityDeserialiser::new(value))
    }
}

impl ObjectMessage {
    pub fn serialise<S: EntitySerialiser + ?Sized>(&self, writer: &mut S) -> SerialiserResult<()> {
        writer.begin_entity()?;
        writer.write_u64(self.id)?;
        writer.write_u64(self.entity_type.as_raw())?;
        writer.write_bool(self.is_transferable)?;
        writer.write_bool(self.is_persistent)?;
        writer.write_u64(self.owner_id)?;
        write_optional_u64(writer, self.parent_id)?;

        writer.begin_components()?;
        for component in self.components.values() {
            component.write(writer)?;
        }
        write_view(writer, &self.view)?;
        writer.end_components()?;

        writer.end_entity()
    }

    pub fn deserialise<D: EntityDeserialiser + ?Sized>(reader: &mut D) -> SerialiserResult<Self> {
        reader.enter_entity()?;
        let id = reader.read_u64()?;
        let raw_type = reader.read_u64()?;
        let entity_type = SpaceEntityType::from_raw(raw_type)
            .ok_or_else(|| SerialiserError::Malformed(format!("unknown entity type {}", raw_type)))?;
        let is_transferable = reader.read_bool()?;
        let is_persistent = reader.read_bool()?;
        let owner_id = reader.read_u64()?;
        let parent_id = read_optional_u64(reader)?;

        reader.enter_components()?;
        let mut components = BTreeMap::new();
        for _ in 0..reader.num_real_components()? {
            let (component_id, raw_type) = reader.enter_component()?;
            let component = Component::read_entered(reader, component_id, ComponentType::from_raw(raw_type))?;
            reader.leave_component()?;
            components.insert(component_id, component);
        }
        let view = read_view(reader);
        reader.leave_components()?;
        reader.leave_entity()?;

        Ok(Self { id, entity_type, is_transferable, is_persistent, owner_id, parent_id, components, view })
    }

    pub fn to_json(&self) -> SerialiserResult<Value> {
        let mut writer = JsonEntitySerialiser::new();
        self.serialise(&mut writer)?;
        writer.into_value()
    }

    pub fn from_json(value: Value) -> SerialiserResult<Self> {
        Self::deserialise(&mut JsonEntityDeserialiser::new(value))
    }
}

fn write_optional_u64<S: EntitySerialiser + ?Sized>(writer: &mut S, value: Option<u64>) -> SerialiserResult<()> {
    match value {
        Some(v) => writer.write_u64(v),
        None => writer.write_null(),
    }
}

fn read_optional_u64<D: EntityDeserialiser + ?Sized>(reader: &mut D) -> SerialiserResult<Option<u64>> {
    if reader.next_value_is_null() {
        reader.skip()?;
        Ok(None)
    } else {
        reader.read_u64().map(Some)
    }
}

fn write_view<S: EntitySerialiser + ?Sized>(writer: &mut S, view: &BTreeMap<u16, ReplicatedValue>) -> SerialiserResult<()> {
    for (key, value) in view {
        writer.add_view_component(*key, value)?;
    }
    Ok(())
}

fn read_view<D: EntityDeserialiser + ?Sized>(reader: &D) -> BTreeMap<u16, ReplicatedValue> {
    VIEW_KEYS
        .iter()
        .filter_map(|key| reader.get_view_component(*key).map(|value| (*key, value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use spaces_shared::types::Vector3;

    fn snapshot() -> ObjectMessage {
        let mut model = Component::new(0, ComponentType::StaticModel);
        model.set_property(1, ReplicatedValue::from("chair.glb"));
        model.set_property(2, ReplicatedValue::Boolean(true));
        let mut custom = Component::new(7, ComponentType::Unknown(99));
        custom.set_property(0, ReplicatedValue::Integer(-3));

        ObjectMessage {
            id: 42,
            entity_type: SpaceEntityType::Object,
            is_transferable: true,
            is_persistent: false,
            owner_id: 5,
            parent_id: None,
            components: BTreeMap::from([(0, model), (7, custom)]),
            view: BTreeMap::from([
                (COMPONENT_KEY_VIEW_ENTITY_NAME, ReplicatedValue::from("Chair")),
                (COMPONENT_KEY_VIEW_POSITION, ReplicatedValue::from(Vector3::new(1.0, 0.0, -2.0))),
            ]),
        }
    }

    #[test]
    fn snapshot_survives_the_wire() {
        let message = snapshot();
        let decoded = ObjectMessage::from_json(message.to_json().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn view_components_count_toward_total_only() {
        let mut reader = JsonEntityDeserialiser::new(snapshot().to_json().unwrap());
        reader.enter_entity().unwrap();
        for _ in 0..6 {
            reader.skip().unwrap();
        }
        reader.enter_components().unwrap();
        assert_eq!(reader.num_components().unwrap(), 4);
        assert_eq!(reader.num_real_components().unwrap(), 2);
    }

    #[test]
    fn patch_keeps_deletes_and_parent_changes() {
        let mut patch = ObjectPatch::new(42, 5);
        patch.parent = Some(None);
        patch.components.insert(3, ComponentPatch::Delete);
        patch.view.insert(COMPONENT_KEY_VIEW_LOCK_TYPE, ReplicatedValue::Integer(1));

        let decoded = ObjectPatch::from_json(patch.to_json().unwrap()).unwrap();
        assert_eq!(decoded, patch);

        let unchanged = ObjectPatch::from_json(ObjectPatch::new(42, 5).to_json().unwrap()).unwrap();
        assert_eq!(unchanged.parent, None);
    }

    #[test]
    fn unknown_entity_type_is_malformed() {
        let json = serde_json::json!([1, 9, false, false, 0, null, {}]);
        assert!(matches!(ObjectMessage::from_json(json), Err(SerialiserError::Malformed(_))));
    }
}
