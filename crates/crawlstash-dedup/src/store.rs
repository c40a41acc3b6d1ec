//! The store facade: opens the persistent namespaces, runs recovery, and
//! exposes source-level ingest plus the maintenance operations.

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{error, info};

use crate::config::StoreConfig;
use crate::content::{ContentStore, FsContentStore, MemoryContentStore};
use crate::digest::{ContentFingerprint, IdentifierFingerprint};
use crate::engine::{Decision, DedupEngine, IngestRequest};
use crate::error::{StoreError, StoreResult};
use crate::index::ContentIndex;
use crate::kind::{ArtifactKey, ArtifactKind};
use crate::maintenance::{self, CleanupReport, IsolationReport, StoreStats};
use crate::metadata::{JsonMetadataStore, MemoryMetadataStore, MetadataRecord, MetadataStore};
use crate::metrics::{IngestMetrics, MetricsSnapshot};
use crate::naming::derive_original_name;
use crate::recovery::{self, IntegrityFinding, IntegrityIssue, RecoveryReport};
use crate::wal::{FsWal, MemoryWal, WriteAheadLog};

/// Payloads up to this size are fingerprinted on the calling task.
const INLINE_DIGEST_LIMIT: usize = 64 * 1024;

fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::TaskFailed(e.to_string())
}

/// Content-addressed dedup store for crawler artifacts.
#[derive(Debug)]
pub struct DedupStore {
    config: StoreConfig,
    engine: DedupEngine,
    recovery: RwLock<RecoveryReport>,
}

impl DedupStore {
    /// Open the store under `config.root`, replaying the write-ahead log and
    /// running the recovery scan. Fails with [`StoreError::Integrity`] when
    /// `strict_recovery` is set and the scan finds errors.
    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let settings = config.clone();
        let (content, metadata, wal) = tokio::task::spawn_blocking(move || -> StoreResult<_> {
            std::fs::create_dir_all(&settings.root)?;
            let content = FsContentStore::open(&settings.root)?;
            let metadata = JsonMetadataStore::open(&settings.root)?;
            let next_tx = content.staged()?.into_iter().max().map_or(1, |tx| tx + 1);
            let wal = FsWal::open(&settings.root, settings.wal_compact_threshold, next_tx)?;
            Ok((content, metadata, wal))
        })
        .await
        .map_err(join_error)??;

        info!(root = %config.root.display(), "Opening dedup store");
        let content: Arc<dyn ContentStore> = Arc::new(content);
        let metadata: Arc<dyn MetadataStore> = Arc::new(metadata);
        let wal: Arc<dyn WriteAheadLog> = Arc::new(wal);
        let index = Arc::new(ContentIndex::new());

        let report = {
            let (content, metadata, wal, index) = (content.clone(), metadata.clone(), wal.clone(), index.clone());
            let verify = config.verify_payloads;
            tokio::task::spawn_blocking(move || {
                recovery::scan(wal.as_ref(), content.as_ref(), metadata.as_ref(), &index, verify)
            })
            .await
            .map_err(join_error)??
        };
        Self::assemble(config, content, metadata, wal, index, report)
    }

    /// A store kept entirely in memory.
    pub fn in_memory(config: StoreConfig) -> StoreResult<Self> {
        let wal = MemoryWal::new(config.wal_compact_threshold);
        Self::with_backends(
            config,
            Arc::new(MemoryContentStore::new()),
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(wal),
        )
    }

    /// A store over caller-supplied backends. Runs the recovery scan on the
    /// current thread.
    pub fn with_backends(
        config: StoreConfig,
        content: Arc<dyn ContentStore>,
        metadata: Arc<dyn MetadataStore>,
        wal: Arc<dyn WriteAheadLog>,
    ) -> StoreResult<Self> {
        config.validate()?;
        let index = Arc::new(ContentIndex::new());
        let report = recovery::scan(
            wal.as_ref(),
            content.as_ref(),
            metadata.as_ref(),
            &index,
            config.verify_payloads,
        )?;
        Self::assemble(config, content, metadata, wal, index, report)
    }

    fn assemble(
        config: StoreConfig,
        content: Arc<dyn ContentStore>,
        metadata: Arc<dyn MetadataStore>,
        wal: Arc<dyn WriteAheadLog>,
        index: Arc<ContentIndex>,
        report: RecoveryReport,
    ) -> StoreResult<Self> {
        if config.strict_recovery && !report.is_clean() {
            error!(errors = report.errors(), "Refusing to open store with integrity errors");
            return Err(StoreError::Integrity(report.error_findings()));
        }
        let metrics = Arc::new(IngestMetrics::new());
        metrics.record_replays(report.replayed as u64);
        let engine = DedupEngine::new(content, metadata, index, wal, &config, metrics);
        Ok(Self {
            config,
            engine,
            recovery: RwLock::new(report),
        })
    }

    /// Configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The underlying engine.
    pub fn engine(&self) -> &DedupEngine {
        &self.engine
    }

    fn validate_len(&self, source_identifier: &str, len: u64) -> StoreResult<()> {
        if len == 0 {
            return Err(StoreError::EmptyPayload {
                source_identifier: source_identifier.to_string(),
            });
        }
        if len > self.config.max_payload_bytes {
            return Err(StoreError::PayloadTooLarge {
                size: len,
                limit: self.config.max_payload_bytes,
            });
        }
        Ok(())
    }

    /// Ingest a payload fetched from `source_identifier`.
    ///
    /// `original_name` defaults to the last path segment of the URL.
    pub async fn ingest(
        &self,
        source_identifier: &str,
        kind: ArtifactKind,
        payload: impl Into<Bytes>,
        original_name: Option<&str>,
    ) -> StoreResult<Decision> {
        let payload = payload.into();
        self.validate_len(source_identifier, payload.len() as u64)?;
        let name = original_name
            .map(str::to_string)
            .unwrap_or_else(|| derive_original_name(source_identifier, kind));

        let request = if payload.len() <= INLINE_DIGEST_LIMIT {
            IngestRequest::new(source_identifier, kind, payload, name)
        } else {
            let source = source_identifier.to_string();
            tokio::task::spawn_blocking(move || IngestRequest::new(source, kind, payload, name))
                .await
                .map_err(join_error)?
        };
        self.engine.ingest_fingerprinted(request).await
    }

    /// Ingest a payload streamed from `reader`, digesting it in blocks.
    pub async fn ingest_reader<R>(
        &self,
        source_identifier: &str,
        kind: ArtifactKind,
        reader: R,
        original_name: Option<&str>,
    ) -> StoreResult<Decision>
    where
        R: Read + Send + 'static,
    {
        let limit = self.config.max_payload_bytes;
        let (payload, content) = tokio::task::spawn_blocking(move || ContentFingerprint::digest_reader(reader, limit))
            .await
            .map_err(join_error)??;
        self.validate_len(source_identifier, payload.len() as u64)?;

        let request = IngestRequest {
            source_identifier: source_identifier.to_string(),
            kind,
            identifier: IdentifierFingerprint::of_source(source_identifier),
            content,
            payload: Bytes::from(payload),
            original_name: original_name
                .map(str::to_string)
                .unwrap_or_else(|| derive_original_name(source_identifier, kind)),
        };
        self.engine.ingest_fingerprinted(request).await
    }

    /// Metadata record of `source_identifier` in `kind`.
    pub fn record(&self, source_identifier: &str, kind: ArtifactKind) -> StoreResult<Option<MetadataRecord>> {
        self.engine
            .metadata()
            .get(&ArtifactKey::for_source(kind, source_identifier))
    }

    /// Stored bytes for `source_identifier`, following a duplicate to its
    /// owner's artifact.
    pub async fn fetch(&self, source_identifier: &str, kind: ArtifactKind) -> StoreResult<Option<Vec<u8>>> {
        let Some(record) = self.record(source_identifier, kind)? else {
            return Ok(None);
        };
        let id = record
            .duplicate_of
            .unwrap_or_else(|| IdentifierFingerprint::of_source(source_identifier));
        let key = ArtifactKey::new(kind, id);
        let content = Arc::clone(self.engine.content());
        tokio::task::spawn_blocking(move || content.read(&key))
            .await
            .map_err(join_error)?
    }

    /// Counts per kind.
    pub async fn stats(&self) -> StoreResult<StoreStats> {
        let content = Arc::clone(self.engine.content());
        let metadata = Arc::clone(self.engine.metadata());
        let index = Arc::clone(self.engine.index());
        tokio::task::spawn_blocking(move || maintenance::stats(content.as_ref(), metadata.as_ref(), &index))
            .await
            .map_err(join_error)?
    }

    /// Remove warning-level leftovers. Waits for in-flight ingests and blocks
    /// new ones until done.
    pub async fn clean_orphans(&self, dry_run: bool) -> StoreResult<CleanupReport> {
        let _exclusive = self.engine.exclusive().await;
        let content = Arc::clone(self.engine.content());
        let metadata = Arc::clone(self.engine.metadata());
        tokio::task::spawn_blocking(move || maintenance::clean_orphans(content.as_ref(), metadata.as_ref(), dry_run))
            .await
            .map_err(join_error)?
    }

    /// Move raw pages that hold binary data (PDF, zip, control bytes) aside
    /// and drop their records. Waits for in-flight ingests and blocks new
    /// ones until done.
    pub async fn isolate_misfiled(&self, dry_run: bool) -> StoreResult<IsolationReport> {
        let _exclusive = self.engine.exclusive().await;
        let content = Arc::clone(self.engine.content());
        let metadata = Arc::clone(self.engine.metadata());
        let index = Arc::clone(self.engine.index());
        let wal = Arc::clone(self.engine.wal());
        let result = tokio::task::spawn_blocking(move || {
            maintenance::isolate_misfiled(content.as_ref(), metadata.as_ref(), &index, wal.as_ref(), dry_run)
        })
        .await
        .map_err(join_error);
        self.engine.refresh_replay_flag();
        result?
    }

    /// Re-run the integrity cross-check against the live store. Committed
    /// transactions that still cannot be applied stay in the findings.
    pub async fn check(&self, verify_payloads: bool) -> StoreResult<Vec<IntegrityFinding>> {
        let _exclusive = self.engine.exclusive().await;
        let content = Arc::clone(self.engine.content());
        let metadata = Arc::clone(self.engine.metadata());
        let checked =
            tokio::task::spawn_blocking(move || recovery::check(content.as_ref(), metadata.as_ref(), verify_payloads))
                .await
                .map_err(join_error)??;

        let pending: BTreeSet<u64> = self.engine.wal().pending().iter().map(|p| p.tx).collect();
        let mut report = self.recovery.write();
        let findings: Vec<_> = report
            .findings
            .iter()
            .filter(|f| matches!(&f.issue, IntegrityIssue::UnappliedTransaction { tx, .. } if pending.contains(tx)))
            .cloned()
            .chain(checked)
            .collect();
        report.findings = findings.clone();
        Ok(findings)
    }

    /// Report of the scan run at open (or of the latest [`Self::check`]).
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery.read().clone()
    }

    /// Decision counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.metrics().snapshot()
    }
}
