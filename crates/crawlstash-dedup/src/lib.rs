#![warn(missing_docs)]

//! crawlstash dedup store: content-addressed storage for crawler artifacts (SHA-256 CAS index, JSON metadata, write-ahead log)
//!
//! Ingest path: Payload → Fingerprint (SHA-256 of URL and bytes) → Lock → Decide → WAL Begin → Apply → WAL Done
//! Open path:   WAL replay → Staging sweep → Index rebuild → Integrity check

pub mod config;
pub mod content;
pub mod digest;
pub mod engine;
pub mod error;
pub mod index;
pub mod kind;
pub mod locking;
pub mod maintenance;
pub mod metadata;
pub mod metrics;
pub mod naming;
pub mod recovery;
pub mod store;
pub mod wal;

pub use config::StoreConfig;
pub use content::{ContentStore, FsContentStore, MemoryContentStore};
pub use digest::{ContentFingerprint, IdentifierFingerprint};
pub use engine::{Decision, DedupEngine, IngestRequest};
pub use error::{ErrorClass, StoreError, StoreResult};
pub use index::{Claim, ContentIndex};
pub use kind::{ArtifactKey, ArtifactKind};
pub use maintenance::{CleanupReport, IsolationReport, KindStats, StoreStats};
pub use metadata::{JsonMetadataStore, MemoryMetadataStore, MetadataRecord, MetadataStore, SalvageReport};
pub use metrics::{IngestMetrics, MetricsSnapshot};
pub use recovery::{BinarySignature, IntegrityFinding, IntegrityIssue, RecoveryReport, Severity};
pub use store::DedupStore;
pub use wal::{FsWal, MemoryWal, PendingTx, ReplayOutcome, WalEntry, WalOp, WriteAheadLog};
