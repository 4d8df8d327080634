//! Test fixtures and helpers.
//!
//! A [`Party`] is one profile with its own engine, key store and scratch
//! directory. Parties exchange PDUs by handing them to each other's router,
//! which is all a transport does from the engine's point of view.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use anyhow::{anyhow, Context, Result};
use prv_core::{codec, ChatId, Pdu};
use prv_engine::{
    DecryptOutcome, EncryptOutcome, Engine, EngineConfig, ManualClock, MemoryKeyStore, Permissions,
    Processed, SessionContext,
};
use prv_store::{MemoryStore, SqliteStore, Store};
use tempfile::TempDir;

/// Start time of every fixture clock: 2023-11-14T22:13:20Z.
pub const START: i64 = 1_700_000_000_000;

static TRACING: Once = Once::new();

/// Route engine logs to the test writer. Filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One profile and its engine.
pub struct Party<S: Store = MemoryStore> {
    pub engine: Arc<Engine<S>>,
    pub ctx: SessionContext,
    pub keys: Arc<MemoryKeyStore>,
    pub clock: Arc<ManualClock>,
    dir: TempDir,
    sources: AtomicUsize,
}

impl Party<MemoryStore> {
    /// A party backed by the in-memory store.
    pub async fn memory(profile: &str, clock: Arc<ManualClock>) -> Result<Self> {
        Self::build(profile, clock, |_| Ok(MemoryStore::new()), |_| {}).await
    }
}

impl Party<SqliteStore> {
    /// A party backed by a SQLite database inside its scratch directory.
    pub async fn sqlite(profile: &str, clock: Arc<ManualClock>) -> Result<Self> {
        Self::build(
            profile,
            clock,
            |dir| Ok(SqliteStore::open(dir.join("prv.db"))?),
            |_| {},
        )
        .await
    }
}

impl<S: Store> Party<S> {
    pub async fn build(
        profile: &str,
        clock: Arc<ManualClock>,
        open_store: impl FnOnce(&Path) -> Result<S>,
        configure: impl FnOnce(&mut EngineConfig),
    ) -> Result<Self> {
        init_tracing();
        let dir = tempfile::tempdir()?;
        let store = open_store(dir.path())?;

        let mut config = EngineConfig::with_base_directory(dir.path().join("out"));
        configure(&mut config);

        let keys = Arc::new(MemoryKeyStore::new());
        let ctx = SessionContext::new(profile, display_name(profile));
        keys.register_profile(&ctx.profile)?;

        let engine = Engine::new(store, keys.clone(), config)?.with_clock(clock.clone());
        engine.initialize().await?;

        Ok(Self {
            engine: Arc::new(engine),
            ctx,
            keys,
            clock,
            dir,
            sources: AtomicUsize::new(0),
        })
    }

    /// The scratch directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to a fresh source file.
    pub fn source(&self, contents: &[u8]) -> Result<PathBuf> {
        let n = self.sources.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.path().join(format!("source-{n}.bin"));
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Seal `contents` for a chat.
    pub async fn encrypt(
        &self,
        chat_id: &ChatId,
        contents: &[u8],
        permissions: Permissions,
    ) -> Result<EncryptOutcome> {
        let path = self.source(contents)?;
        Ok(self
            .engine
            .encrypt_file(&self.ctx, &path, chat_id, permissions)
            .await?)
    }

    pub async fn decrypt(&self, artifact: &Path, chat_id: &ChatId) -> Result<DecryptOutcome> {
        Ok(self.engine.decrypt_file(&self.ctx, artifact, chat_id).await?)
    }

    /// Decrypt and read the plaintext back.
    pub async fn read_plaintext(&self, artifact: &Path, chat_id: &ChatId) -> Result<Vec<u8>> {
        let path = self.decrypt(artifact, chat_id).await?.into_result()?;
        std::fs::read(&path).with_context(|| format!("reading {}", path.display()))
    }

    /// Feed a PDU to our router in transport form.
    pub async fn deliver(&self, pdu: &Pdu) -> Result<Processed> {
        Ok(self
            .engine
            .process_message(&self.ctx, codec::encode(pdu).as_bytes())
            .await?)
    }
}

fn display_name(profile: &str) -> String {
    let mut chars = profile.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Run the handshake: `inviter` invites `invitee`, which accepts.
pub async fn connect<A: Store, B: Store>(
    inviter: &Party<A>,
    invitee: &Party<B>,
    chat_id: &ChatId,
) -> Result<()> {
    let request = inviter
        .engine
        .create_add_request(
            &inviter.ctx,
            chat_id,
            &invitee.ctx.display_name,
            None,
            None,
        )
        .await?;
    let response = invitee
        .deliver(&request)
        .await?
        .reply
        .ok_or_else(|| anyhow!("invitee did not answer the invitation"))?;
    inviter.deliver(&response).await?;
    Ok(())
}

/// Alice and Bob on one clock, in-memory, not connected.
pub async fn two_party() -> Result<(Party, Party)> {
    let clock = Arc::new(ManualClock::new(START));
    let alice = Party::memory("alice", clock.clone()).await?;
    let bob = Party::memory("bob", clock).await?;
    Ok((alice, bob))
}

/// Alice and Bob connected in `chat_id`.
pub async fn connected_pair(chat_id: &ChatId) -> Result<(Party, Party)> {
    let (alice, bob) = two_party().await?;
    connect(&alice, &bob, chat_id).await?;
    Ok((alice, bob))
}
