//! File key wrapping via X25519 key agreement.
//!
//! A file's content key is never sent in the clear. For each peer that may
//! open the file, the owner seals the key to the peer's X25519 credential
//! with a fresh ephemeral key. The wrap is bound to `(file_id, grantee)`, so
//! a wrapped key lifted from one grant cannot be replayed for another.

use serde::{Deserialize, Serialize};

use prv_core::{FileId, PeerId, SealedKey};

use crate::crypto::{
    ephemeral_wrap_key, EncryptionKey, EncryptionNonce, X25519PublicKey, X25519StaticSecret,
};
use crate::error::{PermsError, Result};

/// A file key sealed for exactly one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// The file the key belongs to.
    pub file_id: FileId,

    /// The peer able to unwrap it.
    pub grantee: PeerId,

    /// Ephemeral X25519 public key (sender's side of ECDH).
    pub ephemeral_public: X25519PublicKey,

    /// The file key, encrypted with the derived wrapping key.
    pub encrypted_key: Vec<u8>,

    /// Nonce used for encryption.
    pub nonce: EncryptionNonce,
}

fn binding(file_id: &FileId, grantee: &PeerId) -> Vec<u8> {
    let mut context = Vec::with_capacity(16 + grantee.as_str().len());
    context.extend_from_slice(file_id.as_bytes());
    context.extend_from_slice(grantee.as_str().as_bytes());
    context
}

impl WrappedKey {
    /// Seal `file_key` for `recipient_public`.
    pub fn seal(
        file_id: FileId,
        grantee: PeerId,
        file_key: &EncryptionKey,
        recipient_public: &X25519PublicKey,
    ) -> Result<Self> {
        let (ephemeral_public, wrap_key) =
            ephemeral_wrap_key(recipient_public, &binding(&file_id, &grantee));
        let nonce = EncryptionNonce::generate();
        let encrypted_key = wrap_key.seal(&nonce, file_key.as_bytes(), &[])?;

        Ok(Self {
            file_id,
            grantee,
            ephemeral_public,
            encrypted_key,
            nonce,
        })
    }

    /// Recover the file key with the grantee's secret credential.
    pub fn unwrap(&self, recipient_secret: &X25519StaticSecret) -> Result<EncryptionKey> {
        let wrap_key =
            recipient_secret.wrap_key(&self.ephemeral_public, &binding(&self.file_id, &self.grantee));
        let key_bytes = wrap_key.open(&self.nonce, &self.encrypted_key, &[])?;
        EncryptionKey::try_from_slice(&key_bytes)
    }

    /// The wire form carried inside PDUs.
    pub fn to_sealed(&self) -> SealedKey {
        SealedKey {
            ephemeral_public: self.ephemeral_public.0,
            nonce: self.nonce.0,
            ciphertext: self.encrypted_key.clone(),
        }
    }

    /// Rebuild from the wire form; the binding comes from the enclosing PDU.
    pub fn from_sealed(file_id: FileId, grantee: PeerId, sealed: &SealedKey) -> Self {
        Self {
            file_id,
            grantee,
            ephemeral_public: X25519PublicKey::from_bytes(sealed.ephemeral_public),
            encrypted_key: sealed.ciphertext.clone(),
            nonce: EncryptionNonce::from_bytes(sealed.nonce),
        }
    }

    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).expect("CBOR serialization failed");
        buf
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| PermsError::SerializationError(e.to_string()))
    }
}
