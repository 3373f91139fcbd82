//! # Connection Types
//!
//! Connection states and the error codes reported to connection callbacks.

use serde::{Serialize, Deserialize};
use std::fmt;

/// State of the connection to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,

    /// Handshake acknowledged and listening
    Connected,

    /// Clean shutdown in progress
    Disconnecting,

    /// Not connected. Also the terminal state after an interruption.
    #[default]
    Disconnected,
}

/// Result code carried by connection and event callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    None,
    Unknown,
    NotConnected,
    AlreadyConnected,
    SpaceUserLimitExceeded,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "None",
            Self::Unknown => "Unknown",
            Self::NotConnected => "NotConnected",
            Self::AlreadyConnected => "AlreadyConnected",
            Self::SpaceUserLimitExceeded => "SpaceUserLimitExceeded",
        };
        f.write_str(name)
    }
}
