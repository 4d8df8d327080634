//! Error types for the engine.
//!
//! Every lower-layer error is folded into one taxonomy so that callers can
//! branch on [`ErrorKind`] without knowing which crate produced it.

use prv_core::{CoreError, Malformation};
use prv_perms::{DenyReason, PermsError};
use prv_store::StoreError;
use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bytes that are not a well-formed PDU.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A PDU from a newer protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("unknown file: {0}")]
    UnknownFile(String),

    /// The record was already settled and cannot move again.
    #[error("already resolved: {0}")]
    AlreadyResolved(String),

    #[error("access denied: {0}")]
    AccessDenied(DenyReason),

    /// Key wrapping, sealing or authentication failed.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// Filesystem or storage failure.
    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine was not initialized, or was shut down.
    #[error("engine not initialized")]
    NotInitialized,
}

/// Discriminant of [`EngineError`], for programmatic branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedMessage,
    UnsupportedVersion,
    UnknownPeer,
    UnknownFile,
    AlreadyResolved,
    AccessDenied,
    CryptoFailure,
    IoFailure,
    InvalidArgument,
    NotInitialized,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MalformedMessage(_) => ErrorKind::MalformedMessage,
            EngineError::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            EngineError::UnknownPeer(_) => ErrorKind::UnknownPeer,
            EngineError::UnknownFile(_) => ErrorKind::UnknownFile,
            EngineError::AlreadyResolved(_) => ErrorKind::AlreadyResolved,
            EngineError::AccessDenied(_) => ErrorKind::AccessDenied,
            EngineError::CryptoFailure(_) => ErrorKind::CryptoFailure,
            EngineError::IoFailure(_) => ErrorKind::IoFailure,
            EngineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            EngineError::NotInitialized => ErrorKind::NotInitialized,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    /// A caller-supplied value broke a field limit.
    pub(crate) fn argument(m: Malformation) -> Self {
        EngineError::InvalidArgument(m.to_string())
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::MalformedMessage(m) => EngineError::MalformedMessage(m.to_string()),
            CoreError::UnsupportedVersion(v) => EngineError::UnsupportedVersion(v),
            CoreError::InvalidField(f) => EngineError::InvalidArgument(f),
        }
    }
}

impl From<Malformation> for EngineError {
    fn from(m: Malformation) -> Self {
        EngineError::MalformedMessage(m.to_string())
    }
}

impl From<PermsError> for EngineError {
    fn from(err: PermsError) -> Self {
        if err.is_already_resolved() {
            return EngineError::AlreadyResolved(err.to_string());
        }
        match err {
            PermsError::InvalidTransition { from: None, to } => EngineError::InvalidArgument(
                format!("no grant to move to {}", to.as_str()),
            ),
            e @ (PermsError::LifecycleOutOfRange { .. } | PermsError::LifecycleExhausted(_)) => {
                EngineError::InvalidArgument(e.to_string())
            }
            PermsError::EncryptionError(e)
            | PermsError::DecryptionError(e)
            | PermsError::InvalidArtifact(e) => EngineError::CryptoFailure(e),
            PermsError::SerializationError(e) => EngineError::IoFailure(e),
            PermsError::CoreError(e) => e.into(),
            other => EngineError::AlreadyResolved(other.to_string()),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::IoFailure(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::IoFailure(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
