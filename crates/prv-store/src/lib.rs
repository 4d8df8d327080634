//! # PRV Store
//!
//! Storage abstraction for the PRV engine. Provides a trait-based interface
//! for peer, file and grant persistence with SQLite and in-memory
//! implementations.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`FileRecord`] - A protected file and, on the owner side, its wrapped key
//!
//! ## Usage
//!
//! ```rust,no_run
//! use prv_store::{SqliteStore, Store};
//!
//! async fn example() {
//!     let store = SqliteStore::open("prv.db").unwrap();
//!     let peers = store.list_peers(&"chat-1".into()).await.unwrap();
//!     println!("{} peers", peers.len());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Atomic grant commit**: grant state and wrapped key share one row
//! - **History**: settled lifecycles are archived, never overwritten

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{FileRecord, InsertResult, Store, StoreCounts, StoreExt};
