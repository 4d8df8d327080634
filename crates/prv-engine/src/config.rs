//! Engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Default cap on source file size: 100 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Default number of processed message ids remembered for deduplication.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Configuration for the Engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for engine output. Decrypted files land in `decrypted/` below it.
    pub base_directory: PathBuf,

    /// How many processed message ids to remember.
    pub dedup_capacity: usize,

    /// Largest source file `encrypt_file` accepts, in bytes.
    pub max_file_size: u64,

    /// Extension appended to a source path to name its sealed artifact.
    pub artifact_extension: String,

    /// Trust inbound peer requests immediately and answer them.
    pub auto_accept_peers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_directory: PathBuf::from("prv-data"),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            artifact_extension: "prv".to_string(),
            auto_accept_peers: true,
        }
    }
}

impl EngineConfig {
    /// Default configuration rooted at `base_directory`.
    pub fn with_base_directory(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: base_directory.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::invalid(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is in range.
    pub fn validate(&self) -> Result<()> {
        if self.base_directory.as_os_str().is_empty() {
            return Err(EngineError::invalid("base_directory is empty"));
        }
        if self.dedup_capacity == 0 {
            return Err(EngineError::invalid("dedup_capacity must be positive"));
        }
        if self.max_file_size == 0 {
            return Err(EngineError::invalid("max_file_size must be positive"));
        }
        let ext = &self.artifact_extension;
        if ext.is_empty() || ext.contains(['.', '/', '\\']) {
            return Err(EngineError::invalid(format!(
                "artifact_extension {ext:?} must be a bare extension"
            )));
        }
        Ok(())
    }

    /// Where decrypted output is written.
    pub fn decrypted_dir(&self) -> PathBuf {
        self.base_directory.join("decrypted")
    }

    /// The artifact path for a source file: the source path plus the
    /// artifact extension.
    pub fn artifact_path_for(&self, source: &Path) -> PathBuf {
        let mut name = source.as_os_str().to_owned();
        name.push(".");
        name.push(&self.artifact_extension);
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.dedup_capacity, 10_000);
        assert!(config.auto_accept_peers);
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            EngineConfig::from_json_str(r#"{"base_directory": "/tmp/prv", "auto_accept_peers": false}"#)
                .unwrap();
        assert_eq!(config.base_directory, PathBuf::from("/tmp/prv"));
        assert!(!config.auto_accept_peers);
        assert_eq!(config.max_file_size, DEFAULT_MAX_FILE_SIZE);
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(EngineConfig::from_json_str(r#"{"dedup_capacity": 0}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"artifact_extension": ".prv"}"#).is_err());
        assert!(EngineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_artifact_path_for() {
        let config = EngineConfig::default();
        assert_eq!(
            config.artifact_path_for(Path::new("/docs/report.pdf")),
            PathBuf::from("/docs/report.pdf.prv")
        );
    }
}
