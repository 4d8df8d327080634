//! Store trait: the abstract interface for engine persistence.
//!
//! This trait keeps the engine storage-agnostic. Implementations include
//! SQLite (primary) and in-memory (for tests).

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use prv_core::{ChatId, FileId, PeerId};
use prv_perms::{AccessGrant, GrantState, PeerRecord, Transition, TrustState, WrappedKey};

use crate::error::Result;

/// Result of inserting a file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    /// Record was inserted.
    Inserted,
    /// A record with this file id already exists (idempotent, not an error).
    AlreadyExists,
}

/// A protected file known to this engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: FileId,
    pub chat_id: ChatId,
    pub owner: PeerId,
    pub file_name: String,

    /// Where the sealed artifact was written. Only known on the owner side.
    pub artifact_path: Option<PathBuf>,

    pub created_at: i64,

    /// The file key wrapped for the owner's own credential.
    pub owner_key: Option<WrappedKey>,
}

/// Row counts, for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub peers: u64,
    pub trusted_peers: u64,
    pub files: u64,
    pub grants: u64,
    pub granted: u64,
    pub archived_grants: u64,
}

/// The Store trait: async interface for engine persistence.
///
/// # Design Notes
///
/// - **One record per key**: peers are keyed by `(chat_id, peer_id)`,
///   grants by `(file_id, peer_id)`. Writes replace the live record.
/// - **Atomic grant commit**: a grant, its wrapped key and the archival of
///   a previous lifecycle are written together or not at all.
/// - **Idempotent file insert**: inserting a known file id returns
///   `AlreadyExists` and leaves the stored record untouched.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Peer Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace a peer record.
    async fn put_peer(&self, peer: &PeerRecord) -> Result<()>;

    /// Get a peer record.
    async fn get_peer(&self, chat_id: &ChatId, peer_id: &PeerId) -> Result<Option<PeerRecord>>;

    /// Replace the record stored under `old_id` with `peer`, atomically.
    async fn rekey_peer(&self, old_id: &PeerId, peer: &PeerRecord) -> Result<()>;

    /// List the peers of a chat, ordered by peer id.
    async fn list_peers(&self, chat_id: &ChatId) -> Result<Vec<PeerRecord>>;

    // ─────────────────────────────────────────────────────────────────────────
    // File Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a file record.
    async fn insert_file(&self, file: &FileRecord) -> Result<InsertResult>;

    /// Get a file record.
    async fn get_file(&self, file_id: &FileId) -> Result<Option<FileRecord>>;

    /// List files of a chat.
    async fn list_files(&self, chat_id: &ChatId) -> Result<Vec<FileRecord>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Grant Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the live grant for `(file_id, peer_id)`.
    async fn get_grant(&self, file_id: &FileId, peer_id: &PeerId) -> Result<Option<AccessGrant>>;

    /// Write `next` as the live record, moving `archived` to history.
    async fn commit_grant(&self, next: &AccessGrant, archived: Option<&AccessGrant>)
        -> Result<()>;

    /// Archived lifecycles for `(file_id, peer_id)`, oldest first.
    async fn grant_history(&self, file_id: &FileId, peer_id: &PeerId)
        -> Result<Vec<AccessGrant>>;

    /// Live grants of a file, ordered by peer id.
    async fn list_grants_for_file(&self, file_id: &FileId) -> Result<Vec<AccessGrant>>;

    /// Live grants of a chat.
    async fn list_grants_for_chat(&self, chat_id: &ChatId) -> Result<Vec<AccessGrant>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    /// Row counts.
    async fn counts(&self) -> Result<StoreCounts>;
}

/// Extension trait for common store patterns.
pub trait StoreExt: Store {
    /// Commit the result of a grant transition. No-op transitions write nothing.
    fn commit_transition(
        &self,
        transition: &Transition,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Peers of a chat that completed the handshake.
    fn trusted_peers(
        &self,
        chat_id: &ChatId,
    ) -> impl std::future::Future<Output = Result<Vec<PeerRecord>>> + Send;
}

impl<S: Store + ?Sized> StoreExt for S {
    async fn commit_transition(&self, transition: &Transition) -> Result<()> {
        if !transition.changed {
            return Ok(());
        }
        self.commit_grant(&transition.next, transition.archived.as_ref())
            .await
    }

    async fn trusted_peers(&self, chat_id: &ChatId) -> Result<Vec<PeerRecord>> {
        let peers = self.list_peers(chat_id).await?;
        Ok(peers
            .into_iter()
            .filter(|p| p.trust == TrustState::Trusted)
            .collect())
    }
}

pub(crate) fn count_granted<'a>(grants: impl Iterator<Item = &'a AccessGrant>) -> u64 {
    grants.filter(|g| g.state == GrantState::Granted).count() as u64
}
