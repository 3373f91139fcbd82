//! # Scopes
//!
//! A scope identifies the channel that carries an entity's traffic.

use serde::{Serialize, Deserialize};

/// How messages published in a scope are distributed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PubSubModelType {
    /// Every subscriber receives every message
    #[default]
    Global,
    /// Subscribers receive messages for objects within their solve radius
    Object,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub id: String,
    pub reference_id: String,
    pub reference_type: String,
    pub name: String,
    pub pub_sub_type: PubSubModelType,
    pub solve_radius: Option<f64>,
    /// Whether the backend arbitrates leadership for this scope
    pub managed_leader_election: bool,
}

impl Scope {
    /// The default global scope of a space
    pub fn for_space(space_id: &str) -> Self {
        Self {
            id: space_id.to_string(),
            reference_id: space_id.to_string(),
            reference_type: "GroupId".to_string(),
            name: format!("Space {}", space_id),
            pub_sub_type: PubSubModelType::Global,
            solve_radius: None,
            managed_leader_election: false,
        }
    }
}
