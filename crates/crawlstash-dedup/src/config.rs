use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// Store configuration. Every field has a default, so a config file only
/// needs the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding payloads, markers, metadata and the log.
    pub root: PathBuf,
    /// Bound on waiting for a single lock.
    pub lock_timeout_ms: u64,
    /// Attempts per ingest before lock contention is reported.
    pub max_attempts: u32,
    /// Base of the jittered exponential backoff between attempts.
    pub backoff_base_ms: u64,
    /// Largest accepted payload.
    pub max_payload_bytes: u64,
    /// Re-hash every owner's payload during the recovery scan.
    pub verify_payloads: bool,
    /// Refuse to open when the recovery scan finds errors.
    pub strict_recovery: bool,
    /// Log length (in lines) that triggers compaction once nothing is pending.
    pub wal_compact_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("crawl_output"),
            lock_timeout_ms: 5_000,
            max_attempts: 5,
            backoff_base_ms: 100,
            max_payload_bytes: 256 * 1024 * 1024,
            verify_payloads: false,
            strict_recovery: true,
            wal_compact_threshold: 1024,
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load from a `.toml` or `.json` file, chosen by extension.
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: StoreConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| StoreError::Config(e.to_string()))?,
            "json" => serde_json::from_str(&contents).map_err(|e| StoreError::Config(e.to_string()))?,
            _ => {
                return Err(StoreError::Config(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> StoreResult<()> {
        if self.max_attempts == 0 {
            return Err(StoreError::Config("max_attempts must be at least 1".into()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(StoreError::Config("lock_timeout_ms must be positive".into()));
        }
        if self.max_payload_bytes == 0 {
            return Err(StoreError::Config("max_payload_bytes must be positive".into()));
        }
        Ok(())
    }

    /// Lock timeout as a duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = StoreConfig::default();
        assert_eq!(config.root, PathBuf::from("crawl_output"));
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.backoff_base_ms, 100);
        assert_eq!(config.max_payload_bytes, 256 * 1024 * 1024);
        assert!(!config.verify_payloads);
        assert!(config.strict_recovery);
        assert_eq!(config.wal_compact_threshold, 1024);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "root": "/data/crawl",
                "max_attempts": 8,
                "verify_payloads": true
            }}"#
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.root, PathBuf::from("/data/crawl"));
        assert_eq!(config.max_attempts, 8);
        assert!(config.verify_payloads);
        assert_eq!(config.lock_timeout_ms, 5_000);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
root = "/toml/crawl"
lock_timeout_ms = 250
strict_recovery = false
wal_compact_threshold = 16
            "#
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.root, PathBuf::from("/toml/crawl"));
        assert_eq!(config.lock_timeout_ms, 250);
        assert!(!config.strict_recovery);
        assert_eq!(config.wal_compact_threshold, 16);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "root: /x").unwrap();
        match StoreConfig::from_file(file.path()) {
            Err(StoreError::Config(msg)) => assert!(msg.contains("yaml")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "max_attempts = 0").unwrap();
        assert!(matches!(
            StoreConfig::from_file(file.path()),
            Err(StoreError::Config(_))
        ));
    }
}
