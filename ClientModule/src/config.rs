//! # Client Configuration
//!
//! Tunables for the entity system and connection, loadable from JSON.

use serde::{Serialize, Deserialize};
use spaces_shared::constants::entity::{DEFAULT_PATCH_RATE_MS, ENTITY_PAGE_LIMIT};
use std::time::Duration;

use crate::error::{MultiplayerError, MultiplayerResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplayerConfig {
    /// Minimum interval between outgoing patches of one entity
    pub entity_patch_rate_ms: u64,

    /// When false every queued entity is flushed on the next tick
    pub entity_patch_rate_limit_enabled: bool,

    /// Create a client election manager when the entity system starts
    pub leader_election_enabled: bool,

    pub allow_self_messaging: bool,

    /// Entities requested per page during initial retrieval
    pub entity_page_limit: u64,

    /// Period of the background tick loop
    pub tick_interval_ms: u64,
}

impl Default for MultiplayerConfig {
    fn default() -> Self {
        Self {
            entity_patch_rate_ms: DEFAULT_PATCH_RATE_MS,
            entity_patch_rate_limit_enabled: true,
            leader_election_enabled: false,
            allow_self_messaging: false,
            entity_page_limit: ENTITY_PAGE_LIMIT,
            tick_interval_ms: 16,
        }
    }
}

impl MultiplayerConfig {
    /// Parse and validate a config; missing fields take their defaults
    pub fn from_json_str(json: &str) -> MultiplayerResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the tick loop and paged retrieval cannot run with
    pub fn validate(&self) -> MultiplayerResult<()> {
        if self.tick_interval_ms == 0 {
            return Err(MultiplayerError::InvalidConfig("tick_interval_ms must be at least 1".to_string()));
        }
        if self.entity_page_limit == 0 {
            return Err(MultiplayerError::InvalidConfig("entity_page_limit must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn entity_patch_rate(&self) -> Duration {
        Duration::from_millis(self.entity_patch_rate_ms)
    }

    /// Never zero, so a hand-built config cannot stall the tick loop
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn entity_page_limit(&self) -> u64 {
        self.entity_page_limit.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = MultiplayerConfig::from_json_str(r#"{"leader_election_enabled": true}"#).unwrap();
        assert!(config.leader_election_enabled);
        assert_eq!(config.entity_patch_rate_ms, 90);
        assert_eq!(config.entity_page_limit, 100);
    }

    #[test]
    fn rejects_bad_json() {
        assert!(matches!(MultiplayerConfig::from_json_str("{"), Err(MultiplayerError::Json(_))));
    }

    #[test]
    fn rejects_zero_tick_interval_and_page_limit() {
        let zero_tick = MultiplayerConfig::from_json_str(r#"{"tick_interval_ms": 0}"#);
        assert!(matches!(zero_tick, Err(MultiplayerError::InvalidConfig(_))));

        let zero_page = MultiplayerConfig::from_json_str(r#"{"entity_page_limit": 0}"#);
        assert!(matches!(zero_page, Err(MultiplayerError::InvalidConfig(_))));
    }

    #[test]
    fn hand_built_zero_values_are_clamped() {
        let config = MultiplayerConfig { tick_interval_ms: 0, entity_page_limit: 0, ..Default::default() };
        assert!(config.validate().is_err());
        assert_eq!(config.tick_interval(), Duration::from_millis(1));
        assert_eq!(config.entity_page_limit(), 1);
    }
}
