//! Credential storage.
//!
//! The engine never holds private keys. It asks a [`KeyStore`] for public
//! credentials and to unwrap file keys on its behalf, so secrets stay
//! behind this trait.

use std::collections::HashMap;
use std::sync::RwLock;

use prv_core::{ChatId, PeerId};
use prv_perms::{EncryptionKey, WrappedKey, X25519PublicKey, X25519StaticSecret};

use crate::error::{EngineError, Result};

/// Storage for our own X25519 secrets and the credentials peers sent us.
pub trait KeyStore: Send + Sync {
    /// Our public credential for `profile`.
    fn public_key(&self, profile: &PeerId) -> Result<X25519PublicKey>;

    /// The credential a peer presented in a chat, if any.
    fn peer_credential(&self, chat_id: &ChatId, peer_id: &PeerId)
        -> Result<Option<X25519PublicKey>>;

    /// Remember a peer's credential, replacing any previous one.
    fn store_peer_credential(
        &self,
        chat_id: &ChatId,
        peer_id: &PeerId,
        key: X25519PublicKey,
    ) -> Result<()>;

    /// Unwrap a file key sealed for `profile`.
    fn unwrap(&self, profile: &PeerId, wrapped: &WrappedKey) -> Result<EncryptionKey>;
}

/// In-process key store.
#[derive(Default)]
pub struct MemoryKeyStore {
    profiles: RwLock<HashMap<PeerId, X25519StaticSecret>>,
    peers: RwLock<HashMap<(ChatId, PeerId), X25519PublicKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a credential for `profile` unless one exists. Returns the
    /// public half.
    pub fn register_profile(&self, profile: &PeerId) -> Result<X25519PublicKey> {
        let mut profiles = self.profiles.write().map_err(|_| poisoned())?;
        let secret = profiles
            .entry(profile.clone())
            .or_insert_with(X25519StaticSecret::generate);
        Ok(secret.public_key())
    }

    /// Install a known secret for `profile`.
    pub fn import_profile(&self, profile: &PeerId, secret: [u8; 32]) -> Result<X25519PublicKey> {
        let secret = X25519StaticSecret::from_bytes(secret);
        let public = secret.public_key();
        let mut profiles = self.profiles.write().map_err(|_| poisoned())?;
        profiles.insert(profile.clone(), secret);
        Ok(public)
    }
}

fn poisoned() -> EngineError {
    EngineError::IoFailure("key store lock poisoned".into())
}

fn no_profile(profile: &PeerId) -> EngineError {
    EngineError::invalid(format!("no credential for profile {profile}"))
}

impl KeyStore for MemoryKeyStore {
    fn public_key(&self, profile: &PeerId) -> Result<X25519PublicKey> {
        let profiles = self.profiles.read().map_err(|_| poisoned())?;
        profiles
            .get(profile)
            .map(X25519StaticSecret::public_key)
            .ok_or_else(|| no_profile(profile))
    }

    fn peer_credential(
        &self,
        chat_id: &ChatId,
        peer_id: &PeerId,
    ) -> Result<Option<X25519PublicKey>> {
        let peers = self.peers.read().map_err(|_| poisoned())?;
        Ok(peers.get(&(chat_id.clone(), peer_id.clone())).copied())
    }

    fn store_peer_credential(
        &self,
        chat_id: &ChatId,
        peer_id: &PeerId,
        key: X25519PublicKey,
    ) -> Result<()> {
        let mut peers = self.peers.write().map_err(|_| poisoned())?;
        peers.insert((chat_id.clone(), peer_id.clone()), key);
        Ok(())
    }

    fn unwrap(&self, profile: &PeerId, wrapped: &WrappedKey) -> Result<EncryptionKey> {
        if &wrapped.grantee != profile {
            return Err(EngineError::CryptoFailure(format!(
                "key is wrapped for {}, not {profile}",
                wrapped.grantee
            )));
        }
        let profiles = self.profiles.read().map_err(|_| poisoned())?;
        let secret = profiles.get(profile).ok_or_else(|| no_profile(profile))?;
        Ok(wrapped.unwrap(secret)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use prv_core::FileId;

    #[test]
    fn test_register_is_stable() {
        let keys = MemoryKeyStore::new();
        let alice = PeerId::from("alice");
        let first = keys.register_profile(&alice).unwrap();
        let second = keys.register_profile(&alice).unwrap();
        assert_eq!(first, second);
        assert_eq!(keys.public_key(&alice).unwrap(), first);
    }

    #[test]
    fn test_unknown_profile() {
        let keys = MemoryKeyStore::new();
        let err = keys.public_key(&"nobody".into()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_unwrap_for_profile() {
        let keys = MemoryKeyStore::new();
        let bob = PeerId::from("bob");
        let public = keys.register_profile(&bob).unwrap();

        let file_key = EncryptionKey::generate();
        let file_id = FileId::from_bytes([7; 16]);
        let wrapped = WrappedKey::seal(file_id, bob.clone(), &file_key, &public).unwrap();

        assert_eq!(keys.unwrap(&bob, &wrapped).unwrap(), file_key);

        keys.register_profile(&"carol".into()).unwrap();
        let err = keys.unwrap(&"carol".into(), &wrapped).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoFailure);
    }

    #[test]
    fn test_peer_credentials_are_per_chat() {
        let keys = MemoryKeyStore::new();
        let cred = X25519StaticSecret::generate().public_key();
        keys.store_peer_credential(&"chat1".into(), &"bob".into(), cred)
            .unwrap();
        assert_eq!(
            keys.peer_credential(&"chat1".into(), &"bob".into()).unwrap(),
            Some(cred)
        );
        assert_eq!(
            keys.peer_credential(&"chat2".into(), &"bob".into()).unwrap(),
            None
        );
    }
}
