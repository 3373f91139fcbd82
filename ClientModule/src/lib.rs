//! # Spaces Client Module
//!
//! Client-side replication for Spaces: entities and their components, the
//! tick-driven patch loop, client leader election, entity scripts and the
//! session with the multiplayer backend.
//!
//! The system is organized into several sub-modules:
//! - `entity`: Space entities, wire messages and the entity system
//! - `election`: Deterministic leader election between clients
//! - `script`: Entity scripts and the scripting capability traits
//! - `net`: Connection lifecycle, transport trait and network event bus
//! - `serialization`: JSON encoding of values and entities
//! - `runtime`: Background tick driver

use std::sync::{Mutex, MutexGuard, PoisonError};

// Module declarations
pub mod cancellation; // Cooperative cancellation
pub mod config;       // Client configuration
pub mod election;     // Leader election
pub mod entity;       // Entities and the entity system
pub mod error;        // Error types
pub mod net;          // Network layer
pub mod runtime;      // Tick driver
pub mod script;       // Entity scripts
pub mod serialization; // Wire encoding

// Re-export commonly used items
pub use cancellation::CancellationToken;
pub use config::MultiplayerConfig;
pub use election::ClientElectionManager;
pub use entity::{Component, EntityHandle, ObjectMessage, ObjectPatch, SpaceEntity, SpaceEntitySystem};
pub use error::{MultiplayerError, MultiplayerResult, TransportError};
pub use net::event_bus::NetworkEventBus;
pub use net::transport::Transport;
pub use net::MultiplayerConnection;
pub use script::{EntityScript, ScriptRunner};
pub use spaces_shared::{ConnectionState, ErrorCode, ReplicatedValue};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
