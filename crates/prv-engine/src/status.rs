//! Read-only status snapshots.

use prv_core::PROTOCOL_VERSION;
use prv_perms::ARTIFACT_VERSION;
use prv_store::{Store, StoreCounts};
use serde::Serialize;
use tracing::warn;

use crate::engine::Engine;
use crate::error::Result;

/// Versions of the engine and of its two formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub engine: &'static str,
    pub protocol: u8,
    pub artifact: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    pub initialized: bool,
    pub version: VersionInfo,
    pub store: StoreCounts,
    /// Message ids currently remembered for re-delivery.
    pub dedup_entries: usize,
    pub dedup_capacity: usize,
    pub locks: LockCounts,
}

/// Keys held by the per-record lock maps. Dead entries are pruned lazily,
/// so these count keys seen recently rather than locks held right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockCounts {
    pub grants: usize,
    pub peers: usize,
    pub messages: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub initialized: bool,
    pub store_ok: bool,
    pub base_directory_ok: bool,
    /// First problem found, if any.
    pub detail: Option<String>,
}

/// The running engine's versions.
pub fn version() -> VersionInfo {
    VersionInfo {
        engine: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        artifact: ARTIFACT_VERSION,
    }
}

impl<S: Store> Engine<S> {
    pub fn version(&self) -> VersionInfo {
        version()
    }

    /// Counters for display. Works before `initialize`.
    pub async fn system_status(&self) -> Result<SystemStatus> {
        let store = self.store.counts().await?;
        Ok(SystemStatus {
            initialized: self.is_initialized(),
            version: version(),
            store,
            dedup_entries: self.dedup().len(),
            dedup_capacity: self.config.dedup_capacity,
            locks: LockCounts {
                grants: self.grant_locks.tracked(),
                peers: self.peer_locks.tracked(),
                messages: self.message_locks.tracked(),
            },
        })
    }

    /// Check the store and the output directory.
    pub async fn health_status(&self) -> HealthStatus {
        let mut detail = None;

        let store_ok = match self.store.counts().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "store health check failed");
                detail = Some(format!("store: {e}"));
                false
            }
        };

        let dir = self.config.decrypted_dir();
        let base_directory_ok = match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => true,
            Ok(_) => {
                detail.get_or_insert_with(|| format!("{} is not a directory", dir.display()));
                false
            }
            Err(e) => {
                detail.get_or_insert_with(|| format!("{}: {e}", dir.display()));
                false
            }
        };

        let initialized = self.is_initialized();
        if !initialized {
            detail.get_or_insert_with(|| "engine not initialized".to_string());
        }

        HealthStatus {
            healthy: initialized && store_ok && base_directory_ok,
            initialized,
            store_ok,
            base_directory_ok,
            detail,
        }
    }
}
