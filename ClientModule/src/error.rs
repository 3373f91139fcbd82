//! # Client Errors
//!
//! Error types used inside the client. Public callbacks never carry these
//! directly; they are logged or reduced to an [`ErrorCode`] at the boundary.

use spaces_shared::connection::ErrorCode;
use spaces_shared::error::{SerialiserError, ValueTypeError};
use spaces_shared::types::EntityId;
use thiserror::Error;

/// Failure reported by a [`Transport`](crate::net::transport::Transport)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport connection is closed")]
    Closed,

    #[error("space user limit exceeded")]
    SpaceUserLimitExceeded,

    #[error("remote error: {0}")]
    Remote(String),
}

impl TransportError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Closed => ErrorCode::NotConnected,
            Self::SpaceUserLimitExceeded => ErrorCode::SpaceUserLimitExceeded,
            Self::Remote(_) => ErrorCode::Unknown,
        }
    }
}

#[derive(Debug, Error)]
pub enum MultiplayerError {
    #[error("not connected")]
    NotConnected,

    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Serialiser(#[from] SerialiserError),

    #[error(transparent)]
    Value(#[from] ValueTypeError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl MultiplayerError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotConnected => ErrorCode::NotConnected,
            Self::Transport(err) => err.error_code(),
            _ => ErrorCode::Unknown,
        }
    }
}

pub type MultiplayerResult<T> = Result<T, MultiplayerError>;
