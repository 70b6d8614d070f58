//! Error types for the data model and codec.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors produced while encoding, decoding or validating records.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization to CBOR failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// Deserialization from CBOR failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// The value does not describe a valid record.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl CodecError {
    /// Creates an invalid-record error.
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord(message.into())
    }
}
