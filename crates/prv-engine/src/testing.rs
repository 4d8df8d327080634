//! Shared fixtures for the engine's unit tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use prv_core::{codec, ChatId, Pdu};
use prv_perms::Permissions;
use prv_store::MemoryStore;
use tempfile::TempDir;

use crate::clock::ManualClock;
use crate::config::EngineConfig;
use crate::context::SessionContext;
use crate::credentials::MemoryKeyStore;
use crate::engine::Engine;
use crate::files::EncryptOutcome;
use crate::router::Processed;

pub const START: i64 = 1_700_000_000_000;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One profile with its own engine, key store and directory.
pub struct Harness {
    pub engine: Arc<Engine<MemoryStore>>,
    pub ctx: SessionContext,
    pub keys: Arc<MemoryKeyStore>,
    pub clock: Arc<ManualClock>,
    pub dir: TempDir,
    sources: AtomicUsize,
}

impl Harness {
    pub async fn new(profile: &str) -> Self {
        Self::build(profile, Arc::new(ManualClock::new(START)), |_| {}).await
    }

    pub async fn build(
        profile: &str,
        clock: Arc<ManualClock>,
        configure: impl Fn(&mut EngineConfig),
    ) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::with_base_directory(dir.path().join("out"));
        configure(&mut config);

        let keys = Arc::new(MemoryKeyStore::new());
        let ctx = SessionContext::new(profile, capitalize(profile));
        keys.register_profile(&ctx.profile).unwrap();

        let engine = Engine::new(MemoryStore::new(), keys.clone(), config)
            .unwrap()
            .with_clock(clock.clone());
        engine.initialize().await.unwrap();

        Self {
            engine: Arc::new(engine),
            ctx,
            keys,
            clock,
            dir,
            sources: AtomicUsize::new(0),
        }
    }

    /// Write `contents` to a fresh source file.
    pub fn source(&self, contents: &[u8]) -> PathBuf {
        let n = self.sources.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.path().join(format!("source-{n}.txt"));
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub async fn encrypt(
        &self,
        chat_id: &ChatId,
        contents: &[u8],
        permissions: Permissions,
    ) -> EncryptOutcome {
        let path = self.source(contents);
        self.engine
            .encrypt_file(&self.ctx, &path, chat_id, permissions)
            .await
            .unwrap()
    }

    /// Feed a PDU through the router in transport form.
    pub async fn deliver(&self, pdu: &Pdu) -> Processed {
        self.engine
            .process_message(&self.ctx, codec::encode(pdu).as_bytes())
            .await
            .unwrap()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Alice and Bob on one clock, not yet connected.
pub async fn pair() -> (Harness, Harness) {
    pair_with(|_| {}).await
}

pub async fn pair_with(configure: impl Fn(&mut EngineConfig)) -> (Harness, Harness) {
    let clock = Arc::new(ManualClock::new(START));
    let alice = Harness::build("alice", clock.clone(), &configure).await;
    let bob = Harness::build("bob", clock, &configure).await;
    (alice, bob)
}

/// Alice invites Bob into `chat_id` and Bob accepts.
pub async fn connected(chat_id: &ChatId) -> (Harness, Harness) {
    let (alice, bob) = pair().await;
    let request = alice
        .engine
        .create_add_request(&alice.ctx, chat_id, "Bob", None, None)
        .await
        .unwrap();
    let response = bob.deliver(&request).await.reply.unwrap();
    alice.deliver(&response).await;
    (alice, bob)
}
