//! Error types for the PRV core.

use thiserror::Error;

/// Core errors that can occur while decoding or validating PDUs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("malformed message: {0}")]
    MalformedMessage(Malformation),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid field: {0}")]
    InvalidField(String),
}

/// Why a message was rejected as malformed.
///
/// Callers see a single `MalformedMessage` kind; this is the internal detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Malformation {
    #[error("invalid base64 framing: {0}")]
    Base64(String),

    #[error("bad magic marker")]
    BadMagic,

    #[error("protocol version 0 is reserved")]
    ZeroVersion,

    #[error("truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("{0} trailing bytes after body")]
    TrailingBytes(usize),

    #[error("body of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("unknown PDU tag {0}")]
    UnknownTag(u8),

    #[error("undecodable body: {0}")]
    Body(String),

    #[error("field violates limits: {0}")]
    Field(String),
}

impl From<Malformation> for CoreError {
    fn from(m: Malformation) -> Self {
        CoreError::MalformedMessage(m)
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
