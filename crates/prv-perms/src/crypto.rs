//! Primitives behind file envelopes and key wrapping.
//!
//! ChaCha20-Poly1305 seals both file contents and wrapped file keys. The
//! key that wraps a file key for one grantee comes from X25519 agreement
//! between an ephemeral sender key and the grantee's credential, run through
//! BLAKE3 in derive-key mode with the `(file, grantee)` binding mixed in.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::{PermsError, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
/// Poly1305 tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

const WRAP_CONTEXT: &str = "prv-perms-v1 2024 file-key-wrap";

/// A profile's public credential, as exchanged in the peer handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct X25519PublicKey(pub [u8; 32]);

impl X25519PublicKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// The long-lived secret behind a profile's credential.
///
/// Only the key store holds these; the engine asks it to unwrap.
pub struct X25519StaticSecret(StaticSecret);

impl X25519StaticSecret {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(rand::thread_rng()))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey(*PublicKey::from(&self.0).as_bytes())
    }

    /// Recipient side of a wrap: rebuild the wrapping key from the sender's
    /// ephemeral public key.
    pub fn wrap_key(&self, ephemeral_public: &X25519PublicKey, binding: &[u8]) -> EncryptionKey {
        let shared = self.0.diffie_hellman(&PublicKey::from(ephemeral_public.0));
        derive_wrap_key(shared.as_bytes(), binding)
    }
}

/// Sender side of a wrap. Returns the ephemeral public key to ship with the
/// ciphertext and the wrapping key; the ephemeral secret is gone on return.
pub fn ephemeral_wrap_key(
    recipient: &X25519PublicKey,
    binding: &[u8],
) -> (X25519PublicKey, EncryptionKey) {
    let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
    let public = X25519PublicKey(*PublicKey::from(&secret).as_bytes());
    let shared = secret.diffie_hellman(&PublicKey::from(recipient.0));
    (public, derive_wrap_key(shared.as_bytes(), binding))
}

fn derive_wrap_key(shared: &[u8; 32], binding: &[u8]) -> EncryptionKey {
    let mut hasher = blake3::Hasher::new_derive_key(WRAP_CONTEXT);
    hasher.update(shared);
    hasher.update(binding);
    EncryptionKey(*hasher.finalize().as_bytes())
}

/// A ChaCha20-Poly1305 key: a file's content key or a derived wrapping key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

impl EncryptionKey {
    /// A fresh random key. Every file gets its own.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Rebuild a key recovered from a wrap.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            PermsError::DecryptionError(format!(
                "invalid key length: expected {KEY_LEN}, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encrypt `plaintext`, authenticating `aad` alongside it.
    pub fn seal(&self, nonce: &EncryptionNonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .encrypt(Nonce::from_slice(&nonce.0), Payload { msg: plaintext, aad })
            .map_err(|e| PermsError::EncryptionError(e.to_string()))
    }

    /// Decrypt `ciphertext`. Fails unless `aad` is exactly what was sealed.
    pub fn open(&self, nonce: &EncryptionNonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .decrypt(Nonce::from_slice(&nonce.0), Payload { msg: ciphertext, aad })
            .map_err(|e| PermsError::DecryptionError(e.to_string()))
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

/// A 96-bit nonce. Random per seal; keys are never reused with a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionNonce(pub [u8; NONCE_LEN]);

impl EncryptionNonce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}
