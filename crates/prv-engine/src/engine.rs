//! The Engine: unified API for protected file sharing.
//!
//! The Engine brings together storage, credentials and the permission
//! state machines. Operations are split by concern across `trust`,
//! `grants`, `files` and `router`; this module holds the shared state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use prv_core::{ChatId, FileId, MessageId, PeerId};
use prv_perms::PeerRecord;
use prv_store::{FileRecord, Store};
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::context::SessionContext;
use crate::credentials::KeyStore;
use crate::dedup::DedupCache;
use crate::error::{EngineError, Result};
use crate::locks::KeyedLocks;
use crate::router::Processed;

/// The main Engine struct.
///
/// Shared through `Arc`; every operation takes `&self`. Grant transitions
/// are serialized per `(file_id, peer_id)`, peer transitions per
/// `(chat_id, peer_id)` and message processing per message id.
pub struct Engine<S: Store> {
    /// The storage backend.
    pub(crate) store: Arc<S>,
    /// Our secrets and the credentials peers sent us.
    pub(crate) keys: Arc<dyn KeyStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,

    initialized: AtomicBool,
    temp_counter: AtomicU64,

    pub(crate) grant_locks: KeyedLocks<(FileId, PeerId)>,
    pub(crate) peer_locks: KeyedLocks<(ChatId, PeerId)>,
    pub(crate) message_locks: KeyedLocks<MessageId>,
    dedup: Mutex<DedupCache<MessageId, Processed>>,
}

impl<S: Store> Engine<S> {
    /// Create a new engine. Call [`Engine::initialize`] before use.
    pub fn new(store: S, keys: Arc<dyn KeyStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: Arc::new(store),
            keys,
            clock: Arc::new(SystemClock),
            dedup: Mutex::new(DedupCache::new(config.dedup_capacity)),
            config,
            initialized: AtomicBool::new(false),
            temp_counter: AtomicU64::new(0),
            grant_locks: KeyedLocks::new(),
            peer_locks: KeyedLocks::new(),
            message_locks: KeyedLocks::new(),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the store reference.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Prepare the output directories and start accepting calls.
    ///
    /// Calling it again on a running engine is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        tokio::fs::create_dir_all(self.config.decrypted_dir()).await?;
        // The store must be reachable.
        self.store.counts().await?;

        self.initialized.store(true, Ordering::SeqCst);
        info!(base = %self.config.base_directory.display(), "engine initialized");
        Ok(())
    }

    /// Stop accepting calls and forget processed message ids.
    pub fn shutdown(&self) {
        if self.initialized.swap(false, Ordering::SeqCst) {
            self.dedup().clear();
            info!("engine shut down");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(EngineError::NotInitialized)
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shared helpers
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    pub(crate) fn dedup(&self) -> MutexGuard<'_, DedupCache<MessageId, Processed>> {
        // Only plain inserts and lookups happen under this lock.
        self.dedup.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A fresh suffix for temporary output files.
    pub(crate) fn next_temp_suffix(&self) -> u64 {
        self.temp_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn require_file(&self, file_id: &FileId) -> Result<FileRecord> {
        self.store
            .get_file(file_id)
            .await?
            .ok_or_else(|| EngineError::UnknownFile(file_id.to_hex()))
    }

    /// A file the acting profile owns. Files owned by others are reported
    /// as unknown.
    pub(crate) async fn require_owned_file(
        &self,
        ctx: &SessionContext,
        file_id: &FileId,
    ) -> Result<FileRecord> {
        let file = self.require_file(file_id).await?;
        if file.owner != ctx.profile {
            return Err(EngineError::UnknownFile(file_id.to_hex()));
        }
        Ok(file)
    }

    pub(crate) async fn require_trusted_peer(
        &self,
        chat_id: &ChatId,
        peer_id: &PeerId,
    ) -> Result<PeerRecord> {
        match self.store.get_peer(chat_id, peer_id).await? {
            Some(peer) if peer.is_trusted() => Ok(peer),
            _ => Err(EngineError::UnknownPeer(format!("{peer_id} in chat {chat_id}"))),
        }
    }
}
