//! # Entity Types
//!
//! Enumerations describing entities and their components on the wire.

use serde::{Serialize, Deserialize};
use std::ops::{BitOr, BitOrAssign};

/// Kind of a replicated entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceEntityType {
    Avatar,
    Object,
}

impl SpaceEntityType {
    pub fn as_raw(self) -> u64 {
        match self {
            Self::Avatar => 0,
            Self::Object => 1,
        }
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Avatar),
            1 => Some(Self::Object),
            _ => None,
        }
    }
}

/// Lock state of an entity. A locked entity rejects local modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LockType {
    #[default]
    None,
    UserAgnostic,
}

impl LockType {
    pub fn as_raw(self) -> i64 {
        match self {
            Self::None => 0,
            Self::UserAgnostic => 1,
        }
    }

    pub fn from_raw(raw: i64) -> Self {
        match raw {
            1 => Self::UserAgnostic,
            _ => Self::None,
        }
    }
}

/// Kind of a component. Unrecognised wire values are preserved as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentType {
    Invalid,
    Core,
    StaticModel,
    AnimatedModel,
    AvatarData,
    ScriptData,
    Custom,
    Light,
    Button,
    Image,
    Text,
    Audio,
    Collision,
    Unknown(u64),
}

impl ComponentType {
    pub fn as_raw(self) -> u64 {
        match self {
            Self::Invalid => 0,
            Self::Core => 1,
            Self::StaticModel => 2,
            Self::AnimatedModel => 3,
            Self::AvatarData => 4,
            Self::ScriptData => 5,
            Self::Custom => 6,
            Self::Light => 7,
            Self::Button => 8,
            Self::Image => 9,
            Self::Text => 10,
            Self::Audio => 11,
            Self::Collision => 12,
            Self::Unknown(raw) => raw,
        }
    }

    pub fn from_raw(raw: u64) -> Self {
        match raw {
            0 => Self::Invalid,
            1 => Self::Core,
            2 => Self::StaticModel,
            3 => Self::AnimatedModel,
            4 => Self::AvatarData,
            5 => Self::ScriptData,
            6 => Self::Custom,
            7 => Self::Light,
            8 => Self::Button,
            9 => Self::Image,
            10 => Self::Text,
            11 => Self::Audio,
            12 => Self::Collision,
            other => Self::Unknown(other),
        }
    }
}

/// How a component changed in a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentUpdateType {
    Add,
    Update,
    Delete,
}

/// One component change reported to entity update callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentUpdateInfo {
    pub component_id: u16,
    pub update_type: ComponentUpdateType,
}

/// Which script owner runs an entity's script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScriptScope {
    /// Run by the client owning the script
    #[default]
    Owner,
    /// Owner-independent; run by the elected leader
    Leader,
}

impl ScriptScope {
    pub fn as_raw(self) -> i64 {
        match self {
            Self::Owner => 0,
            Self::Leader => 1,
        }
    }

    pub fn from_raw(raw: i64) -> Self {
        match raw {
            1 => Self::Leader,
            _ => Self::Owner,
        }
    }
}

/// Set of entity fields touched by a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntityUpdateFlags(u32);

impl EntityUpdateFlags {
    pub const NONE: Self = Self(0);
    pub const NAME: Self = Self(1);
    pub const POSITION: Self = Self(1 << 1);
    pub const ROTATION: Self = Self(1 << 2);
    pub const SCALE: Self = Self(1 << 3);
    pub const COMPONENTS: Self = Self(1 << 4);
    pub const SELECTION_ID: Self = Self(1 << 5);
    pub const LOCK_TYPE: Self = Self(1 << 6);
    pub const PARENT: Self = Self(1 << 7);
    pub const OWNER: Self = Self(1 << 8);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EntityUpdateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EntityUpdateFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_component_types_survive() {
        assert_eq!(ComponentType::from_raw(5), ComponentType::ScriptData);
        assert_eq!(ComponentType::from_raw(900).as_raw(), 900);
    }

    #[test]
    fn flags_combine() {
        let mut flags = EntityUpdateFlags::POSITION;
        flags |= EntityUpdateFlags::COMPONENTS;
        assert!(flags.contains(EntityUpdateFlags::POSITION));
        assert!(!flags.contains(EntityUpdateFlags::NAME));
        assert!(EntityUpdateFlags::NONE.is_empty());
    }
}
