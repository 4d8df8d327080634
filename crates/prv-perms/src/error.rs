//! Error types for the permissions module.

use thiserror::Error;

use crate::grant::GrantState;
use crate::peer::TrustState;

/// Errors that can occur during permission operations.
#[derive(Debug, Error)]
pub enum PermsError {
    /// The grant is not in a state that allows the requested transition.
    ///
    /// `from` is `None` when no grant exists yet.
    #[error("invalid grant transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: Option<GrantState>,
        to: GrantState,
    },

    /// A message refers to an older lifecycle than the current record.
    #[error("stale lifecycle {got}, current is {current}")]
    StaleLifecycle { current: u32, got: u32 },

    /// A message names a lifecycle more than one past the current record.
    #[error("lifecycle {got} skips ahead of current {current}")]
    LifecycleOutOfRange { current: u32, got: u32 },

    /// The record has no lifecycle left to open.
    #[error("lifecycle {0} cannot be renewed")]
    LifecycleExhausted(u32),

    /// The peer binding was already settled.
    #[error("peer already resolved as {0:?}")]
    PeerAlreadyResolved(TrustState),

    /// Encryption error.
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// Decryption error, including failed authentication.
    #[error("decryption error: {0}")]
    DecryptionError(String),

    /// The bytes are not a sealed artifact we understand.
    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Core error.
    #[error("core error: {0}")]
    CoreError(#[from] prv_core::CoreError),
}

impl PermsError {
    /// True for the errors that mean "already settled, cannot move again".
    pub fn is_already_resolved(&self) -> bool {
        match self {
            PermsError::InvalidTransition { from, .. } => from.is_some(),
            PermsError::StaleLifecycle { .. } | PermsError::PeerAlreadyResolved(_) => true,
            _ => false,
        }
    }
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
