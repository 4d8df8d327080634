//! # PRV Engine
//!
//! Per-file access control for protected file sharing inside a chat
//! transport.
//!
//! ## Overview
//!
//! The engine sits between a chat client and its transport:
//!
//! - **Peers**: a handshake binds a chat peer to an X25519 credential
//! - **Files**: each file is sealed once under a fresh key, which is wrapped
//!   per recipient
//! - **Grants**: owners accept, deny and revoke access per `(file, peer)`,
//!   with download, forward and expiry terms
//! - **Router**: inbound PDUs are decoded, deduplicated and applied
//!
//! The engine never sends anything. Every operation that needs to tell a
//! peer something returns the PDU; callers deliver it.
//!
//! ## Key Concepts
//!
//! - **SessionContext**: the acting profile, passed into every call
//! - **Lifecycle**: each request/grant cycle of a `(file, peer)` pair is
//!   numbered; settled lifecycles move to history
//! - **Replay**: a re-delivered message id returns the stored outcome
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use prv_engine::{Engine, EngineConfig, MemoryKeyStore, SessionContext};
//! use prv_engine::store::SqliteStore;
//!
//! async fn example() {
//!     let keys = Arc::new(MemoryKeyStore::new());
//!     let ctx = SessionContext::new("alice", "Alice");
//!     keys.register_profile(&ctx.profile).unwrap();
//!
//!     let store = SqliteStore::open("prv.db").unwrap();
//!     let engine = Engine::new(store, keys, EngineConfig::default()).unwrap();
//!     engine.initialize().await.unwrap();
//!
//!     // Invite a peer and hand the PDU to the transport
//!     let invite = engine
//!         .create_add_request(&ctx, &"chat-1".into(), "Bob", None, None)
//!         .await
//!         .unwrap();
//!     let payload = prv_engine::core::encode(&invite);
//!
//!     // Later, feed inbound payloads to the router
//!     // let processed = engine.process_message(&ctx, inbound.as_bytes()).await?;
//! #   let _ = payload;
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `prv_engine::core` - PDUs, identifiers and the codec
//! - `prv_engine::perms` - grant and trust state machines, crypto
//! - `prv_engine::store` - storage abstraction and SQLite

pub mod clock;
pub mod config;
pub mod context;
pub mod credentials;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod files;
pub mod grants;
pub mod locks;
pub mod router;
pub mod status;
pub mod trust;

#[cfg(test)]
mod testing;

// Re-export component crates
pub use prv_core as core;
pub use prv_perms as perms;
pub use prv_store as store;

// Re-export main types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use context::SessionContext;
pub use credentials::{KeyStore, MemoryKeyStore};
pub use engine::Engine;
pub use error::{EngineError, ErrorKind, Result};
pub use files::{DecryptOutcome, EncryptOutcome};
pub use grants::{AccessStatus, ChatDeletion, FileAccessStatus, GrantOutcome};
pub use router::{Outcome, Processed};
pub use status::{version, HealthStatus, LockCounts, SystemStatus, VersionInfo};
pub use trust::{PeerAnswer, PeerResolution};

pub use prv_core::{is_protocol_message, ChatId, FileId, MessageId, Pdu, PduKind, PeerId};
pub use prv_perms::{AccessDecision, AccessGrant, DenyReason, GrantState, Operation, Permissions};
