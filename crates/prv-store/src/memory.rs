//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use prv_core::{ChatId, FileId, PeerId};
use prv_perms::{AccessGrant, PeerRecord, TrustState};

use crate::error::{Result, StoreError};
use crate::traits::{count_granted, FileRecord, InsertResult, Store, StoreCounts};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    peers: BTreeMap<(ChatId, PeerId), PeerRecord>,
    files: BTreeMap<FileId, FileRecord>,
    grants: BTreeMap<(FileId, PeerId), AccessGrant>,
    history: BTreeMap<(FileId, PeerId), Vec<AccessGrant>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner.write().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_peer(&self, peer: &PeerRecord) -> Result<()> {
        let mut inner = self.write()?;
        inner
            .peers
            .insert((peer.chat_id.clone(), peer.peer_id.clone()), peer.clone());
        Ok(())
    }

    async fn get_peer(&self, chat_id: &ChatId, peer_id: &PeerId) -> Result<Option<PeerRecord>> {
        let inner = self.read()?;
        Ok(inner
            .peers
            .get(&(chat_id.clone(), peer_id.clone()))
            .cloned())
    }

    async fn rekey_peer(&self, old_id: &PeerId, peer: &PeerRecord) -> Result<()> {
        let mut inner = self.write()?;
        inner.peers.remove(&(peer.chat_id.clone(), old_id.clone()));
        inner
            .peers
            .insert((peer.chat_id.clone(), peer.peer_id.clone()), peer.clone());
        Ok(())
    }

    async fn list_peers(&self, chat_id: &ChatId) -> Result<Vec<PeerRecord>> {
        let inner = self.read()?;
        Ok(inner
            .peers
            .values()
            .filter(|p| &p.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn insert_file(&self, file: &FileRecord) -> Result<InsertResult> {
        let mut inner = self.write()?;
        if inner.files.contains_key(&file.file_id) {
            return Ok(InsertResult::AlreadyExists);
        }
        inner.files.insert(file.file_id, file.clone());
        Ok(InsertResult::Inserted)
    }

    async fn get_file(&self, file_id: &FileId) -> Result<Option<FileRecord>> {
        let inner = self.read()?;
        Ok(inner.files.get(file_id).cloned())
    }

    async fn list_files(&self, chat_id: &ChatId) -> Result<Vec<FileRecord>> {
        let inner = self.read()?;
        Ok(inner
            .files
            .values()
            .filter(|f| &f.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn get_grant(&self, file_id: &FileId, peer_id: &PeerId) -> Result<Option<AccessGrant>> {
        let inner = self.read()?;
        Ok(inner.grants.get(&(*file_id, peer_id.clone())).cloned())
    }

    async fn commit_grant(
        &self,
        next: &AccessGrant,
        archived: Option<&AccessGrant>,
    ) -> Result<()> {
        let mut inner = self.write()?;
        let key = (next.file_id, next.peer_id.clone());
        if let Some(old) = archived {
            inner.history.entry(key.clone()).or_default().push(old.clone());
        }
        inner.grants.insert(key, next.clone());
        Ok(())
    }

    async fn grant_history(
        &self,
        file_id: &FileId,
        peer_id: &PeerId,
    ) -> Result<Vec<AccessGrant>> {
        let inner = self.read()?;
        Ok(inner
            .history
            .get(&(*file_id, peer_id.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_grants_for_file(&self, file_id: &FileId) -> Result<Vec<AccessGrant>> {
        let inner = self.read()?;
        Ok(inner
            .grants
            .values()
            .filter(|g| &g.file_id == file_id)
            .cloned()
            .collect())
    }

    async fn list_grants_for_chat(&self, chat_id: &ChatId) -> Result<Vec<AccessGrant>> {
        let inner = self.read()?;
        Ok(inner
            .grants
            .values()
            .filter(|g| &g.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let inner = self.read()?;
        Ok(StoreCounts {
            peers: inner.peers.len() as u64,
            trusted_peers: inner
                .peers
                .values()
                .filter(|p| p.trust == TrustState::Trusted)
                .count() as u64,
            files: inner.files.len() as u64,
            grants: inner.grants.len() as u64,
            granted: count_granted(inner.grants.values()),
            archived_grants: inner.history.values().map(|h| h.len() as u64).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;
    use prv_perms::{state, Direction, GrantKey, GrantRole, Invitation};

    fn peer(chat: &str, id: &str) -> PeerRecord {
        prv_perms::peer::invite(
            None,
            Invitation {
                chat_id: chat.into(),
                peer_id: id.into(),
                name: id.to_uppercase(),
                email: None,
                direction: Direction::Outbound,
            },
            0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_peer_put_get_rekey() {
        let store = MemoryStore::new();
        let p = peer("chat1", "inv-1");
        store.put_peer(&p).await.unwrap();

        let mut rekeyed = p.clone();
        rekeyed.peer_id = "bob".into();
        store.rekey_peer(&p.peer_id, &rekeyed).await.unwrap();

        assert!(store.get_peer(&p.chat_id, &p.peer_id).await.unwrap().is_none());
        let got = store.get_peer(&p.chat_id, &"bob".into()).await.unwrap().unwrap();
        assert_eq!(got.invitation_id, PeerId::from("inv-1"));
        assert_eq!(store.list_peers(&p.chat_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_transition_archives() {
        let store = MemoryStore::new();
        let key = GrantKey::new(FileId::from_bytes([1; 16]), "bob".into());
        let chat = ChatId::from("chat1");

        let t = state::request(None, &key, &chat, GrantRole::Owner, 0, 0).unwrap();
        store.commit_transition(&t).await.unwrap();
        let t = state::deny(Some(&t.next), "no", 1).unwrap();
        store.commit_transition(&t).await.unwrap();
        let t = state::request(Some(&t.next), &key, &chat, GrantRole::Owner, 0, 2).unwrap();
        store.commit_transition(&t).await.unwrap();

        let live = store.get_grant(&key.file_id, &key.peer_id).await.unwrap().unwrap();
        assert_eq!(live.lifecycle, 2);
        let history = store.grant_history(&key.file_id, &key.peer_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason.as_deref(), Some("no"));

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.grants, 1);
        assert_eq!(counts.archived_grants, 1);
    }

    #[tokio::test]
    async fn test_insert_file_idempotent() {
        let store = MemoryStore::new();
        let file = FileRecord {
            file_id: FileId::from_bytes([2; 16]),
            chat_id: "chat1".into(),
            owner: "alice".into(),
            file_name: "a.txt".into(),
            artifact_path: None,
            created_at: 0,
            owner_key: None,
        };
        assert_eq!(store.insert_file(&file).await.unwrap(), InsertResult::Inserted);
        assert_eq!(
            store.insert_file(&file).await.unwrap(),
            InsertResult::AlreadyExists
        );
        assert_eq!(store.list_files(&file.chat_id).await.unwrap(), vec![file]);
    }
}
