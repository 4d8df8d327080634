//! Store errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored grant blob did not decode.
    #[error("corrupt grant record: {0}")]
    Serialization(String),

    #[error("migration error: {0}")]
    Migration(String),

    /// A writer panicked while holding the store lock.
    #[error("store lock poisoned")]
    Poisoned,

    /// The `spawn_blocking` task running a query panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
