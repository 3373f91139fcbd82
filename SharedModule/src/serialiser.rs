//! # Entity Serialisation Contracts
//!
//! Symmetric writer/reader interfaces for entities, components and properties.
//! Any wire format implementing both traits is a valid patch encoding.
//!
//! Component ids below [`COMPONENT_KEY_END_COMPONENTS`] are real components; ids at or
//! above it are view components. `num_components` counts both kinds while
//! `num_real_components` counts only the former.
//!
//! [`COMPONENT_KEY_END_COMPONENTS`]: crate::constants::keys::COMPONENT_KEY_END_COMPONENTS

use crate::error::SerialiserError;
use crate::types::{Vector3, Vector4};
use crate::value::ReplicatedValue;

/// Result alias for serialiser operations
pub type SerialiserResult<T> = Result<T, SerialiserError>;

/// Writes entities into some wire representation
pub trait EntitySerialiser {
    fn begin_entity(&mut self) -> SerialiserResult<()>;
    fn end_entity(&mut self) -> SerialiserResult<()>;

    fn begin_array(&mut self) -> SerialiserResult<()>;
    fn end_array(&mut self) -> SerialiserResult<()>;

    fn begin_components(&mut self) -> SerialiserResult<()>;
    fn end_components(&mut self) -> SerialiserResult<()>;

    /// Open a real component. Only valid inside `begin_components`.
    fn begin_component(&mut self, id: u16, component_type: u64) -> SerialiserResult<()>;
    fn end_component(&mut self) -> SerialiserResult<()>;

    fn write_bool(&mut self, value: bool) -> SerialiserResult<()>;
    fn write_byte(&mut self, value: u8) -> SerialiserResult<()>;
    fn write_double(&mut self, value: f64) -> SerialiserResult<()>;
    fn write_i64(&mut self, value: i64) -> SerialiserResult<()>;
    fn write_u64(&mut self, value: u64) -> SerialiserResult<()>;
    fn write_string(&mut self, value: &str) -> SerialiserResult<()>;
    fn write_vector3(&mut self, value: Vector3) -> SerialiserResult<()>;
    fn write_vector4(&mut self, value: Vector4) -> SerialiserResult<()>;
    fn write_null(&mut self) -> SerialiserResult<()>;

    /// Write one property of the open component
    fn write_property(&mut self, id: u64, value: &ReplicatedValue) -> SerialiserResult<()>;

    /// Attach an ephemeral view component. Only valid inside `begin_components`.
    fn add_view_component(&mut self, id: u16, value: &ReplicatedValue) -> SerialiserResult<()>;
}

/// Reads entities written by a matching [`EntitySerialiser`]
pub trait EntityDeserialiser {
    fn enter_entity(&mut self) -> SerialiserResult<()>;
    fn leave_entity(&mut self) -> SerialiserResult<()>;

    /// Enter an array and return its length
    fn enter_array(&mut self) -> SerialiserResult<usize>;
    fn leave_array(&mut self) -> SerialiserResult<()>;

    fn enter_components(&mut self) -> SerialiserResult<()>;
    fn leave_components(&mut self) -> SerialiserResult<()>;

    /// Enter the next real component, skipping view components, and return `(id, type)`
    fn enter_component(&mut self) -> SerialiserResult<(u16, u64)>;
    fn leave_component(&mut self) -> SerialiserResult<()>;

    fn read_bool(&mut self) -> SerialiserResult<bool>;
    fn read_byte(&mut self) -> SerialiserResult<u8>;
    fn read_double(&mut self) -> SerialiserResult<f64>;
    fn read_i64(&mut self) -> SerialiserResult<i64>;
    fn read_u64(&mut self) -> SerialiserResult<u64>;
    fn read_string(&mut self) -> SerialiserResult<String>;
    fn read_vector3(&mut self) -> SerialiserResult<Vector3>;
    fn read_vector4(&mut self) -> SerialiserResult<Vector4>;

    fn next_value_is_null(&self) -> bool;
    fn next_value_is_array(&self) -> bool;

    /// Consume the next value without interpreting it
    fn skip(&mut self) -> SerialiserResult<()>;

    /// Total components including view components
    fn num_components(&self) -> SerialiserResult<usize>;

    /// Components excluding view components
    fn num_real_components(&self) -> SerialiserResult<usize>;

    fn num_properties(&self) -> SerialiserResult<usize>;

    /// Read the next property of the entered component
    fn read_property(&mut self) -> SerialiserResult<(u64, ReplicatedValue)>;

    fn has_view_component(&self, id: u16) -> bool;
    fn get_view_component(&self, id: u16) -> Option<ReplicatedValue>;
}
