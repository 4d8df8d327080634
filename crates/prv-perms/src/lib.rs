//! # PRV Permissions
//!
//! Access grants, peer trust and file envelope cryptography.
//!
//! ## Overview
//!
//! Everything in this crate is pure: state transitions take the current
//! record and return the next one, and the cryptographic helpers work on
//! bytes in memory. Storage and orchestration live in `prv-engine`.
//!
//! ## Key Concepts
//!
//! - **AccessGrant**: one lifecycle of a peer's access to a file
//! - **PeerRecord**: a trust binding between us and a peer within a chat
//! - **SealedArtifact**: an encrypted file with its authenticated header
//! - **WrappedKey**: a file key sealed to one peer's X25519 credential
//!
//! ## Encryption Model
//!
//! Each file gets a fresh content key (ChaCha20-Poly1305). The content key
//! is wrapped for every peer allowed to open the file using X25519 ECDH
//! with an ephemeral key, and BLAKE3 derives the wrapping key bound to the
//! file id and the grantee.

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod grant;
pub mod keyshare;
pub mod peer;
pub mod state;

pub use crypto::{EncryptionKey, EncryptionNonce, X25519PublicKey, X25519StaticSecret};
pub use envelope::{ArtifactHeader, SealedArtifact, ARTIFACT_MAGIC, ARTIFACT_VERSION};
pub use error::{PermsError, Result};
pub use grant::{
    check_access, compute_expiry, AccessDecision, AccessGrant, DenyReason, GrantKey, GrantRole,
    GrantState, Operation, Permissions,
};
pub use keyshare::WrappedKey;
pub use peer::{Direction, Invitation, PeerRecord, Resolution, TrustState};
pub use state::Transition;
