//! # SharedModule
//!
//! Types shared by the Spaces multiplayer client and any wire implementation:
//! the replicated value type, entity and component enumerations, scopes,
//! connection codes and the entity serialisation contracts.

// Export module structure
pub mod types;
pub mod value;
pub mod entity;
pub mod scope;
pub mod constants;
pub mod connection;
pub mod serialiser;
pub mod error;

// Re-export commonly used items for convenience
pub use types::*;
pub use value::{ReplicatedValue, ReplicatedValueType};
pub use entity::{
    ComponentType, ComponentUpdateInfo, ComponentUpdateType, EntityUpdateFlags, LockType, ScriptScope,
    SpaceEntityType,
};
pub use scope::{PubSubModelType, Scope};
pub use connection::{ConnectionState, ErrorCode};
pub use serialiser::{EntityDeserialiser, EntitySerialiser, SerialiserResult};
pub use error::{SerialiserError, ValueTypeError};
