//! Error types for the data model.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or validating records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode a record to CBOR.
    #[error("encoding failed: {0}")]
    Encode(String),

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {0}")]
    Decode(String),

    /// A payload does not match the entity type it was filed under.
    #[error("payload of type {actual} does not match entity type {expected}")]
    TypeMismatch {
        /// Entity type the record claims.
        expected: String,
        /// Entity type of the payload.
        actual: String,
    },

    /// A mutation is structurally invalid.
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    /// An entity id that cannot be stored under a canonical key.
    #[error("invalid entity id {0:?}")]
    InvalidEntityId(String),
}
