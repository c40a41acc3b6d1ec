//! Error types for the crawlstash dedup store

use std::path::PathBuf;

use crate::recovery::IntegrityFinding;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Coarse classification callers use to decide between rejecting, retrying
/// and escalating to an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The input was rejected; retrying the same input fails again.
    Ingest,
    /// Storage failed mid-operation; the whole `ingest` call may be retried.
    Persistence,
    /// Persisted state disagrees with itself; needs an operator.
    Integrity,
}

/// All errors that can occur while ingesting into or recovering the store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Payload had no bytes
    #[error("Empty payload for {source_identifier}")]
    EmptyPayload {
        /// Source identifier of the rejected request.
        source_identifier: String,
    },
    /// Payload exceeded the configured size limit
    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Observed size (may be a lower bound for streamed payloads).
        size: u64,
        /// Configured limit.
        limit: u64,
    },
    /// The payload stream could not be read
    #[error("Unreadable payload: {0}")]
    UnreadablePayload(#[source] std::io::Error),
    /// Artifact kind name not recognised
    #[error("Unknown artifact kind: {0}")]
    UnknownKind(String),
    /// A fingerprint or artifact key failed to parse
    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),
    /// I/O error in one of the persistent namespaces
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization error
    #[error("Serialization error: {reason}")]
    Serialization {
        /// Description of the error.
        reason: String,
    },
    /// A lock was not acquired within the configured timeout
    #[error("Lock contention on {resource}: not acquired within {waited_ms} ms")]
    LockTimeout {
        /// Lock table and key that timed out.
        resource: String,
        /// How long the caller waited.
        waited_ms: u64,
    },
    /// The decision must be taken again from fresh state
    #[error("Contention: {reason}")]
    Contention {
        /// What changed underneath the attempt.
        reason: String,
    },
    /// A committed write-ahead log transaction has not been fully applied
    #[error("Write-ahead log transaction {tx} is pending: {reason}")]
    PendingTransaction {
        /// Transaction id.
        tx: u64,
        /// Failure that interrupted the apply step.
        reason: String,
    },
    /// A failed append could not be cut back off the log; it refuses new
    /// entries until reopened
    #[error("Write-ahead log {} is poisoned: a failed append could not be rolled back", .path.display())]
    WalPoisoned {
        /// Path of the log file.
        path: PathBuf,
    },
    /// A blocking write group panicked or was aborted
    #[error("Write task failed: {0}")]
    TaskFailed(String),
    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
    /// Content fingerprint has more than one owner on record
    #[error("Content {fingerprint} of kind {kind} is quarantined: conflicting owners on record")]
    Quarantined {
        /// Artifact kind name.
        kind: String,
        /// Hex content fingerprint.
        fingerprint: String,
    },
    /// A stored artifact does not hold the bytes its marker claims
    #[error("Artifact {key} does not match content {expected}: found {actual}")]
    ArtifactMismatch {
        /// Artifact key (`kind/identifier`).
        key: String,
        /// Fingerprint the operation expected.
        expected: String,
        /// Fingerprint actually found (or `missing`).
        actual: String,
    },
    /// The metadata file could not be parsed
    #[error("Corrupt metadata file {}: {reason}", .path.display())]
    CorruptMetadata {
        /// Path of the metadata file.
        path: PathBuf,
        /// Parser error.
        reason: String,
    },
    /// The write-ahead log holds an unparseable entry before its tail
    #[error("Corrupt write-ahead log {} at line {line}: {reason}", .path.display())]
    CorruptLog {
        /// Path of the log file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// Parser error.
        reason: String,
    },
    /// The recovery scan found error-severity findings
    #[error("Metadata integrity violation: {}", summarize(.0))]
    Integrity(Vec<IntegrityFinding>),
}

fn summarize(findings: &[IntegrityFinding]) -> String {
    match findings.first() {
        Some(first) if findings.len() > 1 => {
            format!("{} (and {} more)", first, findings.len() - 1)
        }
        Some(first) => first.to_string(),
        None => "no findings".to_string(),
    }
}

impl StoreError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::EmptyPayload { .. }
            | StoreError::PayloadTooLarge { .. }
            | StoreError::UnreadablePayload(_)
            | StoreError::UnknownKind(_)
            | StoreError::InvalidFingerprint(_) => ErrorClass::Ingest,
            StoreError::Quarantined { .. }
            | StoreError::ArtifactMismatch { .. }
            | StoreError::CorruptMetadata { .. }
            | StoreError::CorruptLog { .. }
            | StoreError::Integrity(_) => ErrorClass::Integrity,
            StoreError::Io(_)
            | StoreError::Serialization { .. }
            | StoreError::LockTimeout { .. }
            | StoreError::Contention { .. }
            | StoreError::PendingTransaction { .. }
            | StoreError::WalPoisoned { .. }
            | StoreError::TaskFailed(_)
            | StoreError::Config(_) => ErrorClass::Persistence,
        }
    }

    /// True when the caller may retry the whole `ingest` call.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Persistence
            && !matches!(self, StoreError::Config(_) | StoreError::WalPoisoned { .. })
    }

    /// Lock contention and stale-state conditions the engine retries itself.
    pub(crate) fn is_contention(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout { .. } | StoreError::Contention { .. }
        )
    }

    pub(crate) fn serialization(err: impl std::fmt::Display) -> Self {
        StoreError::Serialization {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{IntegrityIssue, Severity};

    #[test]
    fn test_ingest_errors_are_not_retryable() {
        let err = StoreError::EmptyPayload {
            source_identifier: "https://u.tg/a".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Ingest);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Empty payload for https://u.tg/a");
    }

    #[test]
    fn test_persistence_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = StoreError::from(io);
        assert_eq!(err.class(), ErrorClass::Persistence);
        assert!(err.is_retryable());

        let err = StoreError::LockTimeout {
            resource: "identifier raw_page/ab".to_string(),
            waited_ms: 50,
        };
        assert!(err.is_retryable());
        assert!(err.is_contention());
    }

    #[test]
    fn test_config_error_is_not_retryable() {
        let err = StoreError::Config("bad extension".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_poisoned_log_needs_reopen() {
        let err = StoreError::WalPoisoned {
            path: PathBuf::from("/srv/crawl/wal.jsonl"),
        };
        assert_eq!(err.class(), ErrorClass::Persistence);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_payload_too_large_message() {
        let err = StoreError::PayloadTooLarge {
            size: 2048,
            limit: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Payload too large: 2048 bytes exceeds limit of 1024 bytes"
        );
    }

    #[test]
    fn test_integrity_summary_counts_findings() {
        let finding = IntegrityFinding {
            severity: Severity::Error,
            issue: IntegrityIssue::DiscardedStaging { tx: 7 },
        };
        let err = StoreError::Integrity(vec![finding.clone(), finding]);
        assert_eq!(err.class(), ErrorClass::Integrity);
        assert!(err.to_string().contains("and 1 more"));
        assert!(!err.is_retryable());
    }
}
