use spaces_shared::entity::ComponentType;
use spaces_shared::error::SerialiserError;
use spaces_shared::serialiser::{EntityDeserialiser, EntitySerialiser, SerialiserResult};
use spaces_shared::value::ReplicatedValue;
use std::collections::BTreeMap;

/// A typed property bag attached to an entity
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    id: u16,
    component_type: ComponentType,
    properties: BTreeMap<u32, ReplicatedValue>,
}

impl Component {
    pub fn new(id: u16, component_type: ComponentType) -> Self {
        Self { id, component_type, properties: BTreeMap::new() }
    }

    pub fn get_id(&self) -> u16 {
        self.id
    }

    pub fn get_component_type(&self) -> ComponentType {
        self.component_type
    }

    pub fn get_property(&self, key: u32) -> Option<&ReplicatedValue> {
        self.properties.get(&key)
    }

    pub fn get_properties(&self) -> &BTreeMap<u32, ReplicatedValue> {
        &self.properties
    }

    /// Returns true when the stored value changed
    pub fn set_property(&mut self, key: u32, value: ReplicatedValue) -> bool {
        if self.properties.get(&key) == Some(&value) {
            return false;
        }
        self.properties.insert(key, value);
        true
    }

    pub fn remove_property(&mut self, key: u32) -> bool {
        self.properties.remove(&key).is_some()
    }

    pub(crate) fn write<S: EntitySerialiser + ?Sized>(&self, writer: &mut S) -> SerialiserResult<()> {
        writer.begin_component(self.id, self.component_type.as_raw())?;
        for (key, value) in &self.properties {
            writer.write_property(u64::from(*key), value)?;
        }
        writer.end_component()
    }

    /// Read the properties of a component the reader has already entered
    pub(crate) fn read_entered<D: EntityDeserialiser + ?Sized>(
        reader: &mut D,
        id: u16,
        component_type: ComponentType,
    ) -> SerialiserResult<Self> {
        let mut component = Self::new(id, component_type);
        for _ in 0..reader.num_properties()? {
            let (key, value) = reader.read_property()?;
            let key = u32::try_from(key)
                .map_err(|_| SerialiserError::Malformed(format!("property key {} out of range", key)))?;
            component.properties.insert(key, value);
        }
        Ok(component)
    }
}
