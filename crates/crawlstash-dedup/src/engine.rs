//! Deduplication decision engine.
//!
//! For each `(identifier, content)` pair the engine decides between NEW_SAVE,
//! UNCHANGED_SKIP, UPDATE_REPLACE and DUPLICATE_SKIP, then performs the
//! resulting write group through the write-ahead log so content store,
//! metadata and index move together.
//!
//! Locking: the identifier lock of the ingested key, then the identifier locks
//! of its dependents (duplicates that point at content it is about to
//! release), then the content locks of every content fingerprint involved,
//! each set in sorted order. Everything observed before the content locks is
//! re-checked once they are held; a change means the decision is taken again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::content::ContentStore;
use crate::digest::{ContentFingerprint, IdentifierFingerprint};
use crate::error::{StoreError, StoreResult};
use crate::index::{Claim, ContentIndex};
use crate::kind::{ArtifactKey, ArtifactKind};
use crate::locking::{LockGuard, LockTable};
use crate::metadata::{MetadataRecord, MetadataStore};
use crate::metrics::IngestMetrics;
use crate::wal::{self, WalOp, WriteAheadLog};

/// Lock tables are pruned once they track this many keys.
const LOCK_PRUNE_THRESHOLD: usize = 4096;

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF_MS: u64 = 5_000;

/// Outcome of an ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// First sighting of this content: stored under the identifier.
    NewSave,
    /// The identifier already carries this content. Nothing written.
    UnchangedSkip,
    /// The identifier's content changed: old artifact replaced.
    UpdateReplace,
    /// The content is owned by another identifier: only metadata written,
    /// and nothing at all when the identifier's record already says so
    /// under the same original name.
    DuplicateSkip,
}

impl Decision {
    /// Wire name (`NEW_SAVE`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::NewSave => "NEW_SAVE",
            Decision::UnchangedSkip => "UNCHANGED_SKIP",
            Decision::UpdateReplace => "UPDATE_REPLACE",
            Decision::DuplicateSkip => "DUPLICATE_SKIP",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fingerprinted payload ready for a decision.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Source identifier (URL) as fetched.
    pub source_identifier: String,
    /// Kind partition.
    pub kind: ArtifactKind,
    /// Fingerprint of `source_identifier`.
    pub identifier: IdentifierFingerprint,
    /// Fingerprint of `payload`.
    pub content: ContentFingerprint,
    /// Payload bytes.
    pub payload: Bytes,
    /// Name recorded in metadata.
    pub original_name: String,
}

impl IngestRequest {
    /// Build a request, computing both fingerprints.
    pub fn new(
        source_identifier: impl Into<String>,
        kind: ArtifactKind,
        payload: impl Into<Bytes>,
        original_name: impl Into<String>,
    ) -> Self {
        let source_identifier = source_identifier.into();
        let payload = payload.into();
        Self {
            identifier: IdentifierFingerprint::of_source(&source_identifier),
            content: ContentFingerprint::of(&payload),
            source_identifier,
            kind,
            payload,
            original_name: original_name.into(),
        }
    }

    /// Artifact key of the ingested identifier.
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(self.kind, self.identifier)
    }
}

/// Steps of one write group, bucketed so they can be emitted in apply order:
/// copies, then artifact writes and deletes, then records, then index updates.
#[derive(Debug, Default)]
struct WriteGroup {
    copies: Vec<WalOp>,
    artifacts: Vec<WalOp>,
    records: Vec<(ArtifactKey, MetadataRecord)>,
    index: Vec<WalOp>,
}

impl WriteGroup {
    /// Stop `key` from owning `released`. Dependents are re-pointed at
    /// `successor` when the content stays owned elsewhere; otherwise the
    /// oldest dependent is promoted to owner. Returns true on promotion.
    fn release(
        &mut self,
        key: ArtifactKey,
        released: ContentFingerprint,
        dependents: &[(ArtifactKey, MetadataRecord)],
        successor: Option<IdentifierFingerprint>,
    ) -> bool {
        if let Some(successor) = successor {
            for (dep_key, dep) in dependents {
                self.records.push((
                    *dep_key,
                    MetadataRecord {
                        duplicate_of: Some(successor),
                        ..dep.clone()
                    },
                ));
            }
            return false;
        }

        let Some(((heir_key, heir), rest)) = dependents.split_first() else {
            self.index.push(WalOp::IndexRemove {
                kind: key.kind,
                fingerprint: released,
                owner: key.id,
            });
            return false;
        };

        self.copies.push(WalOp::CopyArtifact {
            from: key,
            to: *heir_key,
            fingerprint: released,
        });
        self.records.push((
            *heir_key,
            MetadataRecord {
                duplicate_of: None,
                timestamp: Utc::now(),
                ..heir.clone()
            },
        ));
        for (dep_key, dep) in rest {
            self.records.push((
                *dep_key,
                MetadataRecord {
                    duplicate_of: Some(heir_key.id),
                    ..dep.clone()
                },
            ));
        }
        self.index.push(WalOp::IndexInsert {
            kind: key.kind,
            fingerprint: released,
            owner: heir_key.id,
        });
        info!(
            from = %key,
            to = %heir_key,
            content = %released.short(),
            remaining = rest.len(),
            "Promoting oldest duplicate to owner"
        );
        true
    }

    fn into_ops(self) -> Vec<WalOp> {
        let mut ops = self.copies;
        ops.extend(self.artifacts);
        if !self.records.is_empty() {
            ops.push(WalOp::PutRecords {
                records: self.records,
            });
        }
        ops.extend(self.index);
        ops
    }
}

/// Decided write group, ready to run.
#[derive(Debug)]
struct Plan {
    decision: Decision,
    ops: Vec<WalOp>,
    /// The payload is published, so it must be staged first.
    stage: bool,
    /// The index entry for the new content was claimed by this attempt.
    claimed: bool,
    promoted: bool,
}

/// Guards held for the duration of a write group.
struct HeldLocks {
    _gate: tokio::sync::OwnedRwLockReadGuard<()>,
    _identifier: LockGuard,
    _dependents: Vec<LockGuard>,
    _content: Vec<LockGuard>,
}

/// The decision engine over a content store, metadata store, index and log.
pub struct DedupEngine {
    content: Arc<dyn ContentStore>,
    metadata: Arc<dyn MetadataStore>,
    index: Arc<ContentIndex>,
    wal: Arc<dyn WriteAheadLog>,
    identifier_locks: LockTable<ArtifactKey>,
    content_locks: LockTable<(ArtifactKind, ContentFingerprint)>,
    /// Shared by ingests, exclusive for replay and maintenance.
    gate: Arc<RwLock<()>>,
    needs_replay: Arc<AtomicBool>,
    metrics: Arc<IngestMetrics>,
    max_attempts: u32,
    backoff_base: Duration,
}

impl DedupEngine {
    /// Assemble an engine. The index must already reflect `metadata`.
    pub fn new(
        content: Arc<dyn ContentStore>,
        metadata: Arc<dyn MetadataStore>,
        index: Arc<ContentIndex>,
        wal: Arc<dyn WriteAheadLog>,
        config: &StoreConfig,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        let needs_replay = Arc::new(AtomicBool::new(!wal.pending().is_empty()));
        Self {
            content,
            metadata,
            index,
            wal,
            identifier_locks: LockTable::new("identifier", config.lock_timeout()),
            content_locks: LockTable::new("content", config.lock_timeout()),
            gate: Arc::new(RwLock::new(())),
            needs_replay,
            metrics,
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    /// Content store.
    pub fn content(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    /// Metadata store.
    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Content-hash index.
    pub fn index(&self) -> &Arc<ContentIndex> {
        &self.index
    }

    /// Write-ahead log.
    pub fn wal(&self) -> &Arc<dyn WriteAheadLog> {
        &self.wal
    }

    /// Decision counters.
    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    /// Wait for in-flight ingests to finish and block new ones while the
    /// returned guard lives.
    pub async fn exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        self.gate.clone().write_owned().await
    }

    /// Decide and apply one ingest.
    ///
    /// Lock contention is retried up to `max_attempts` times with jittered
    /// exponential backoff. Pending log transactions are replayed before an
    /// attempt starts.
    pub async fn ingest_fingerprinted(&self, request: IngestRequest) -> StoreResult<Decision> {
        debug_assert_eq!(request.content, ContentFingerprint::of(&request.payload));
        let payload_len = request.payload.len() as u64;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.needs_replay.load(Ordering::Acquire) {
                if let Err(e) = self.replay_pending().await {
                    self.metrics.record_failure();
                    return Err(e);
                }
            }
            match self.attempt(&request).await {
                Ok(decision) => {
                    self.metrics.record_decision(decision, payload_len);
                    self.prune_locks();
                    return Ok(decision);
                }
                Err(e) if e.is_contention() && attempt < self.max_attempts => {
                    self.metrics.record_retry();
                    let delay = self.backoff(attempt);
                    debug!(key = %request.key(), attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying ingest");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.metrics.record_failure();
                    warn!(key = %request.key(), attempt, error = %e, "Ingest failed");
                    return Err(e);
                }
            }
        }
    }

    /// Replay every pending log transaction under the exclusive gate.
    ///
    /// A transaction whose steps fail stays pending and is returned as
    /// [`StoreError::PendingTransaction`]; ingests keep failing with it until
    /// a replay succeeds.
    pub async fn replay_pending(&self) -> StoreResult<usize> {
        let _exclusive = self.exclusive().await;
        if self.wal.pending().is_empty() {
            self.needs_replay.store(false, Ordering::Release);
            return Ok(0);
        }
        let wal = Arc::clone(&self.wal);
        let content = Arc::clone(&self.content);
        let metadata = Arc::clone(&self.metadata);
        let index = Arc::clone(&self.index);
        let outcome = tokio::task::spawn_blocking(move || {
            wal::replay(wal.as_ref(), content.as_ref(), metadata.as_ref(), &index)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))??;
        if outcome.applied > 0 {
            self.metrics.record_replays(outcome.applied as u64);
            info!(replayed = outcome.applied, "Replayed pending write-ahead log transactions");
        }
        if outcome.stalled.is_none() {
            self.needs_replay.store(false, Ordering::Release);
        }
        outcome.into_result()
    }

    /// Re-derive the replay flag from the log, after a write group that ran
    /// outside [`Self::ingest_fingerprinted`].
    pub fn refresh_replay_flag(&self) {
        self.needs_replay
            .store(!self.wal.pending().is_empty(), Ordering::Release);
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff_base.as_millis() as u64;
        let ceiling = base
            .saturating_mul(1u64 << (attempt - 1).min(16))
            .min(MAX_BACKOFF_MS);
        let half = ceiling / 2;
        Duration::from_millis(half + rand::thread_rng().gen_range(0..=ceiling - half))
    }

    fn prune_locks(&self) {
        if self.identifier_locks.len() > LOCK_PRUNE_THRESHOLD {
            self.identifier_locks.prune();
        }
        if self.content_locks.len() > LOCK_PRUNE_THRESHOLD {
            self.content_locks.prune();
        }
    }

    fn check_replay_flag(&self) -> StoreResult<()> {
        if self.needs_replay.load(Ordering::Acquire) {
            return Err(StoreError::Contention {
                reason: "write-ahead log has a pending transaction".into(),
            });
        }
        Ok(())
    }

    async fn attempt(&self, request: &IngestRequest) -> StoreResult<Decision> {
        let gate = self.gate.clone().read_owned().await;
        let key = request.key();
        let kind = request.kind;
        let id_guard = self.identifier_locks.acquire(&key).await?;
        self.check_replay_flag()?;

        let existing = self.metadata.get(&key)?;
        let observed_owner = self.index.lookup(kind, &request.content)?;

        match (&observed_owner, &existing) {
            (Some(owner), _) if *owner == request.identifier => {
                debug!(key = %key, "Content already owned by this identifier");
                return Ok(Decision::UnchangedSkip);
            }
            (Some(owner), Some(record))
                if record.duplicate_of == Some(*owner)
                    && record.content_fingerprint == request.content
                    && record.original_name == request.original_name =>
            {
                debug!(key = %key, owner = %owner.short(), "Duplicate already recorded");
                return Ok(Decision::DuplicateSkip);
            }
            (None, Some(record)) if record.content_fingerprint == request.content => {
                warn!(
                    key = %key,
                    content = %request.content.short(),
                    duplicate = record.is_duplicate(),
                    "Record matches content but index has no owner; skipping"
                );
                return Ok(Decision::UnchangedSkip);
            }
            _ => {}
        }

        // Content this key owns today and gives up with this decision.
        let released = existing
            .as_ref()
            .filter(|record| !record.is_duplicate())
            .map(|record| record.content_fingerprint);
        let dependents = match released {
            Some(old) => self.metadata.duplicates_of(kind, &request.identifier, &old)?,
            None => Vec::new(),
        };
        let dependent_guards = self
            .identifier_locks
            .acquire_all(dependents.iter().map(|(k, _)| *k))
            .await?;

        let mut content_keys = vec![(kind, request.content)];
        content_keys.extend(released.map(|old| (kind, old)));
        let content_guards = self.content_locks.acquire_all(content_keys).await?;
        self.check_replay_flag()?;

        if self.index.lookup(kind, &request.content)? != observed_owner {
            return Err(StoreError::Contention {
                reason: format!("owner of {} changed", request.content.short()),
            });
        }
        if let Some(old) = released {
            let current = self.metadata.duplicates_of(kind, &request.identifier, &old)?;
            if current.iter().map(|(k, _)| k).ne(dependents.iter().map(|(k, _)| k)) {
                return Err(StoreError::Contention {
                    reason: format!("dependents of {} changed", key),
                });
            }
        }

        let plan = self.plan(request, existing.as_ref(), observed_owner, released, &dependents);
        let held = HeldLocks {
            _gate: gate,
            _identifier: id_guard,
            _dependents: dependent_guards,
            _content: content_guards,
        };
        self.run(request, plan, held).await
    }

    /// Build the write group. Runs under every lock the group touches.
    fn plan(
        &self,
        request: &IngestRequest,
        existing: Option<&MetadataRecord>,
        observed_owner: Option<IdentifierFingerprint>,
        released: Option<ContentFingerprint>,
        dependents: &[(ArtifactKey, MetadataRecord)],
    ) -> Plan {
        let key = request.key();
        let (owner, claimed) = match observed_owner {
            Some(owner) => (Some(owner), false),
            None => match self.index.claim(request.kind, request.content, request.identifier) {
                Claim::Won => (None, true),
                Claim::Lost(winner) => (Some(winner), false),
            },
        };

        let mut group = WriteGroup::default();
        let promoted;
        let decision = match owner {
            Some(owner) => {
                group.records.push((
                    key,
                    MetadataRecord::duplicate(
                        request.original_name.clone(),
                        request.source_identifier.clone(),
                        request.content,
                        owner,
                    ),
                ));
                promoted = match released {
                    Some(old) => {
                        let successor = (old == request.content).then_some(owner);
                        let promoted = group.release(key, old, dependents, successor);
                        group.artifacts.push(WalOp::DeleteArtifact { key });
                        promoted
                    }
                    None => false,
                };
                Decision::DuplicateSkip
            }
            None => {
                promoted = match released {
                    Some(old) => group.release(key, old, dependents, None),
                    None => false,
                };
                group.artifacts.push(WalOp::Publish {
                    key,
                    fingerprint: request.content,
                });
                group.records.push((
                    key,
                    MetadataRecord::owner(
                        request.original_name.clone(),
                        request.source_identifier.clone(),
                        request.content,
                    ),
                ));
                group.index.push(WalOp::IndexInsert {
                    kind: request.kind,
                    fingerprint: request.content,
                    owner: request.identifier,
                });
                if existing.is_some() {
                    Decision::UpdateReplace
                } else {
                    Decision::NewSave
                }
            }
        };

        Plan {
            decision,
            stage: owner.is_none(),
            ops: group.into_ops(),
            claimed,
            promoted,
        }
    }

    /// Run the write group on the blocking pool. The locks move with it, so
    /// the group finishes and releases them even if the caller goes away.
    async fn run(&self, request: &IngestRequest, plan: Plan, held: HeldLocks) -> StoreResult<Decision> {
        let content = Arc::clone(&self.content);
        let metadata = Arc::clone(&self.metadata);
        let index = Arc::clone(&self.index);
        let wal = Arc::clone(&self.wal);
        let needs_replay = Arc::clone(&self.needs_replay);
        let payload = request.payload.clone();
        let key = request.key();
        let fingerprint = request.content;

        let handle = tokio::task::spawn_blocking(move || {
            let _held = held;
            let Plan {
                decision,
                ops,
                stage,
                claimed,
                promoted,
            } = plan;
            let tx = wal.next_tx();

            // Dropped before `_held`, so a panic rolls back under the locks.
            let mut uncommitted = Uncommitted {
                index: claimed.then_some(&*index),
                content: stage.then_some(&*content),
                key,
                fingerprint,
                tx,
            };
            let abort = |e: StoreError| {
                error!(tx, key = %key, error = %e, "Write group aborted before commit");
                e
            };
            if stage {
                content.stage(tx, &payload).map_err(abort)?;
            }
            wal.begin(tx, &ops).map_err(abort)?;
            uncommitted.disarm();

            let applied = wal::apply(tx, &ops, content.as_ref(), metadata.as_ref(), &index)
                .and_then(|()| wal.complete(tx));
            if let Err(e) = applied {
                needs_replay.store(true, Ordering::Release);
                error!(tx, key = %key, error = %e, "Write group committed but not applied; replay pending");
                return Err(StoreError::PendingTransaction {
                    tx,
                    reason: e.to_string(),
                });
            }
            if let Err(e) = wal.compact() {
                warn!(error = %e, "Write-ahead log compaction failed");
            }
            debug!(tx, key = %key, decision = %decision, content = %fingerprint.short(), "Write group applied");
            Ok((decision, promoted))
        });

        match handle.await {
            Ok(Ok((decision, promoted))) => {
                if promoted {
                    self.metrics.record_promotion();
                }
                Ok(decision)
            }
            Ok(Err(e)) => Err(e),
            Err(join) => {
                // A panic after the commit point leaves the transaction pending.
                self.refresh_replay_flag();
                error!(key = %key, error = %join, "Write group task failed");
                Err(StoreError::TaskFailed(join.to_string()))
            }
        }
    }
}

/// Effects of a write group before its commit point: the index claim and the
/// staged payload. Undone on drop unless disarmed, including while a panic
/// unwinds.
struct Uncommitted<'a> {
    index: Option<&'a ContentIndex>,
    content: Option<&'a dyn ContentStore>,
    key: ArtifactKey,
    fingerprint: ContentFingerprint,
    tx: u64,
}

impl Uncommitted<'_> {
    fn disarm(&mut self) {
        self.index = None;
        self.content = None;
    }
}

impl Drop for Uncommitted<'_> {
    fn drop(&mut self) {
        if let Some(index) = self.index {
            index.remove_if(self.key.kind, &self.fingerprint, &self.key.id);
        }
        if let Some(content) = self.content {
            if let Err(e) = content.discard_staged(self.tx) {
                warn!(tx = self.tx, error = %e, "Failed to discard staged payload");
            }
        }
    }
}

impl std::fmt::Debug for DedupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupEngine")
            .field("index_entries", &self.index.len())
            .field("needs_replay", &self.needs_replay.load(Ordering::Relaxed))
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
