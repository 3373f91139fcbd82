//! # Common Types
//!
//! Math and identifier types shared by the wire contracts and the client.

use serde::{Serialize, Deserialize};

/// Unique, immutable identifier of a replicated entity
pub type EntityId = u64;

/// Identifier the backend assigns to each connected client
pub type ClientId = u64;

/// Two-component vector
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector2 {
    pub x: f32,
    pub y: f32,
}

impl Vector2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn zero() -> Self {
        Self { x: 0.0, y: 0.0 }
    }
}

/// Three-component vector, used for positions and scales
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self { x: 0.0, y: 0.0, z: 0.0 }
    }

    pub fn one() -> Self {
        Self { x: 1.0, y: 1.0, z: 1.0 }
    }
}

/// Four-component vector, used for rotations stored as quaternions
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Vector4 {
    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub fn zero() -> Self {
        Self { x: 0.0, y: 0.0, z: 0.0, w: 0.0 }
    }

    /// Identity rotation
    pub fn identity() -> Self {
        Self { x: 0.0, y: 0.0, z: 0.0, w: 1.0 }
    }
}

/// Position, rotation and scale of an entity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpaceTransform {
    pub position: Vector3,
    pub rotation: Vector4,
    pub scale: Vector3,
}

impl SpaceTransform {
    pub fn new(position: Vector3, rotation: Vector4, scale: Vector3) -> Self {
        Self { position, rotation, scale }
    }

    pub fn identity() -> Self {
        Self {
            position: Vector3::zero(),
            rotation: Vector4::identity(),
            scale: Vector3::one(),
        }
    }

    /// Identity rotation and scale at the given position
    pub fn at(position: Vector3) -> Self {
        Self { position, ..Self::identity() }
    }
}

impl Default for SpaceTransform {
    fn default() -> Self {
        Self::identity()
    }
}
