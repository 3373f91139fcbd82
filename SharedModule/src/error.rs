//! # Shared Errors
//!
//! Error types raised by value accessors and the serialiser contracts.

use thiserror::Error;

use crate::value::ReplicatedValueType;

/// A typed accessor was called on a value holding a different variant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("replicated value is {actual:?}, not {expected:?}")]
pub struct ValueTypeError {
    pub expected: ReplicatedValueType,
    pub actual: ReplicatedValueType,
}

/// Failures reported by entity serialisers and deserialisers
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SerialiserError {
    /// A call was made in a frame that does not accept it (e.g. a property outside a component)
    #[error("invalid serialiser state: {0}")]
    InvalidState(&'static str),

    /// The reader ran past the end of the current container
    #[error("unexpected end of data")]
    UnexpectedEnd,

    /// The next value does not have the requested shape
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    /// The payload could not be interpreted at all
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error(transparent)]
    Value(#[from] ValueTypeError),
}
