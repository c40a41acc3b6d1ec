//! Write-ahead log for multi-step write groups.
//!
//! A transaction is committed once its `Begin` entry (carrying every step of
//! the group) is durable. Steps are idempotent, so a `Begin` without a
//! matching `Done` is completed by re-applying it, whether the apply step
//! failed in-process or the process died. The file backend stores one JSON
//! entry per line and fsyncs every append. A failed append is cut back off
//! the file; if that also fails the log refuses further entries until it is
//! reopened.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::content::{fsync_dir, ContentStore};
use crate::digest::{ContentFingerprint, IdentifierFingerprint};
use crate::error::{StoreError, StoreResult};
use crate::index::ContentIndex;
use crate::kind::{ArtifactKey, ArtifactKind};
use crate::metadata::{MetadataRecord, MetadataStore};

/// File name of the log under the store root.
pub const WAL_FILE: &str = "wal.jsonl";

/// One step of a write group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalOp {
    /// Move the payload staged for this transaction under `key`.
    Publish {
        /// Destination artifact.
        key: ArtifactKey,
        /// Fingerprint of the staged payload.
        fingerprint: ContentFingerprint,
    },
    /// Copy an existing artifact (owner promotion).
    CopyArtifact {
        /// Current owner's artifact.
        from: ArtifactKey,
        /// Promoted identifier's artifact.
        to: ArtifactKey,
        /// Content being carried over.
        fingerprint: ContentFingerprint,
    },
    /// Remove an artifact and its marker.
    DeleteArtifact {
        /// Artifact to remove.
        key: ArtifactKey,
    },
    /// Write metadata records in one batch.
    PutRecords {
        /// Records to write.
        records: Vec<(ArtifactKey, MetadataRecord)>,
    },
    /// Point the index entry for `fingerprint` at `owner`.
    IndexInsert {
        /// Kind partition.
        kind: ArtifactKind,
        /// Content fingerprint.
        fingerprint: ContentFingerprint,
        /// New owner.
        owner: IdentifierFingerprint,
    },
    /// Remove the index entry for `fingerprint` if `owner` still holds it.
    IndexRemove {
        /// Kind partition.
        kind: ArtifactKind,
        /// Content fingerprint.
        fingerprint: ContentFingerprint,
        /// Releasing owner.
        owner: IdentifierFingerprint,
    },
    /// Move an artifact and its marker out of the live partition.
    IsolateArtifact {
        /// Artifact to set aside.
        key: ArtifactKey,
    },
    /// Drop metadata records in one batch.
    RemoveRecords {
        /// Records to drop.
        keys: Vec<ArtifactKey>,
    },
}

/// A log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum WalEntry {
    /// Commit point of transaction `tx`.
    Begin {
        /// Transaction id.
        tx: u64,
        /// Steps, in apply order.
        ops: Vec<WalOp>,
    },
    /// Every step of `tx` has been applied.
    Done {
        /// Transaction id.
        tx: u64,
    },
}

/// A committed transaction whose steps may not all be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    /// Transaction id.
    pub tx: u64,
    /// Steps, in apply order.
    pub ops: Vec<WalOp>,
}

/// Durable intent log for write groups.
pub trait WriteAheadLog: Send + Sync {
    /// Allocate a fresh transaction id.
    fn next_tx(&self) -> u64;

    /// Durably record the commit point of `tx`.
    fn begin(&self, tx: u64, ops: &[WalOp]) -> StoreResult<()>;

    /// Durably record that `tx` is fully applied.
    fn complete(&self, tx: u64) -> StoreResult<()>;

    /// Committed transactions without a `Done`, oldest first.
    fn pending(&self) -> Vec<PendingTx>;

    /// Truncate the log when nothing is pending and it has grown past its
    /// threshold. Returns true if it was truncated.
    fn compact(&self) -> StoreResult<bool>;
}

/// Apply the steps of `tx`. Every step is idempotent.
pub fn apply(
    tx: u64,
    ops: &[WalOp],
    content: &dyn ContentStore,
    metadata: &dyn MetadataStore,
    index: &ContentIndex,
) -> StoreResult<()> {
    for op in ops {
        match op {
            WalOp::Publish { key, fingerprint } => content.publish(tx, key, fingerprint)?,
            WalOp::CopyArtifact { from, to, fingerprint } => content.copy(from, to, fingerprint)?,
            WalOp::DeleteArtifact { key } => content.delete(key)?,
            WalOp::PutRecords { records } => metadata.put_batch(records.clone())?,
            WalOp::IndexInsert { kind, fingerprint, owner } => {
                index.insert(*kind, *fingerprint, *owner);
            }
            WalOp::IndexRemove { kind, fingerprint, owner } => {
                index.remove_if(*kind, fingerprint, owner);
            }
            WalOp::IsolateArtifact { key } => content.isolate(key)?,
            WalOp::RemoveRecords { keys } => metadata.remove_batch(keys)?,
        }
    }
    Ok(())
}

/// Run `ops` as one transaction outside an ingest: commit, apply, mark done.
/// A failed apply leaves the transaction pending for replay.
pub fn commit(
    wal: &dyn WriteAheadLog,
    content: &dyn ContentStore,
    metadata: &dyn MetadataStore,
    index: &ContentIndex,
    ops: &[WalOp],
) -> StoreResult<u64> {
    let tx = wal.next_tx();
    wal.begin(tx, ops)?;
    apply(tx, ops, content, metadata, index)
        .and_then(|()| wal.complete(tx))
        .map_err(|e| StoreError::PendingTransaction {
            tx,
            reason: e.to_string(),
        })?;
    if let Err(e) = wal.compact() {
        warn!(error = %e, "Write-ahead log compaction failed");
    }
    Ok(tx)
}

/// Result of a replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Transactions applied and marked done.
    pub applied: usize,
    /// First transaction whose steps failed, with the failure. It and every
    /// later transaction stay pending.
    pub stalled: Option<(u64, String)>,
}

impl ReplayOutcome {
    /// The stalled transaction as an error, if any.
    pub fn into_result(self) -> StoreResult<usize> {
        match self.stalled {
            Some((tx, reason)) => Err(StoreError::PendingTransaction { tx, reason }),
            None => Ok(self.applied),
        }
    }
}

/// Apply pending transactions of `wal` in order, marking each done.
///
/// Stops at the first transaction whose steps fail and leaves it pending;
/// later transactions may depend on it. Failing to write a `Done` entry is
/// returned as an error.
pub fn replay(
    wal: &dyn WriteAheadLog,
    content: &dyn ContentStore,
    metadata: &dyn MetadataStore,
    index: &ContentIndex,
) -> StoreResult<ReplayOutcome> {
    let mut outcome = ReplayOutcome::default();
    for PendingTx { tx, ops } in wal.pending() {
        info!(tx, steps = ops.len(), "Replaying write-ahead log transaction");
        if let Err(e) = apply(tx, &ops, content, metadata, index) {
            error!(tx, error = %e, "Write-ahead log transaction cannot be applied");
            outcome.stalled = Some((tx, e.to_string()));
            break;
        }
        wal.complete(tx)?;
        outcome.applied += 1;
    }
    if outcome.applied > 0 {
        wal.compact()?;
    }
    Ok(outcome)
}

#[derive(Debug)]
struct WalState {
    pending: BTreeMap<u64, Vec<WalOp>>,
    next_tx: u64,
    lines: usize,
}

impl WalState {
    fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            next_tx: 1,
            lines: 0,
        }
    }

    fn record(&mut self, entry: WalEntry) {
        match entry {
            WalEntry::Begin { tx, ops } => {
                self.next_tx = self.next_tx.max(tx + 1);
                self.pending.insert(tx, ops);
            }
            WalEntry::Done { tx } => {
                self.pending.remove(&tx);
            }
        }
        self.lines += 1;
    }

    fn allocate(&mut self) -> u64 {
        let tx = self.next_tx;
        self.next_tx += 1;
        tx
    }

    fn pending(&self) -> Vec<PendingTx> {
        self.pending
            .iter()
            .map(|(tx, ops)| PendingTx {
                tx: *tx,
                ops: ops.clone(),
            })
            .collect()
    }
}

/// In-memory log for tests and dry runs.
#[derive(Debug)]
pub struct MemoryWal {
    state: Mutex<WalState>,
    entries: Mutex<Vec<WalEntry>>,
    compact_threshold: usize,
}

impl MemoryWal {
    /// Create an empty log that compacts at `compact_threshold` lines.
    pub fn new(compact_threshold: usize) -> Self {
        Self {
            state: Mutex::new(WalState::new()),
            entries: Mutex::new(Vec::new()),
            compact_threshold,
        }
    }

    /// Entries currently in the log.
    pub fn entries(&self) -> Vec<WalEntry> {
        self.entries.lock().clone()
    }
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl WriteAheadLog for MemoryWal {
    fn next_tx(&self) -> u64 {
        self.state.lock().allocate()
    }

    fn begin(&self, tx: u64, ops: &[WalOp]) -> StoreResult<()> {
        let entry = WalEntry::Begin { tx, ops: ops.to_vec() };
        self.entries.lock().push(entry.clone());
        self.state.lock().record(entry);
        Ok(())
    }

    fn complete(&self, tx: u64) -> StoreResult<()> {
        self.entries.lock().push(WalEntry::Done { tx });
        self.state.lock().record(WalEntry::Done { tx });
        Ok(())
    }

    fn pending(&self) -> Vec<PendingTx> {
        self.state.lock().pending()
    }

    fn compact(&self) -> StoreResult<bool> {
        let mut state = self.state.lock();
        if !state.pending.is_empty() || state.lines < self.compact_threshold {
            return Ok(false);
        }
        self.entries.lock().clear();
        state.lines = 0;
        Ok(true)
    }
}

/// Append-only JSON-lines log file.
#[derive(Debug)]
pub struct FsWal {
    path: PathBuf,
    file: Mutex<File>,
    state: Mutex<WalState>,
    compact_threshold: usize,
    poisoned: AtomicBool,
    #[cfg(test)]
    fault: Mutex<Option<AppendFault>>,
}

/// Injected append failures.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
enum AppendFault {
    /// Write this many bytes of the line, then fail.
    ShortWrite(usize),
    /// Write the whole line, then fail the sync.
    Sync,
    /// Short write whose rollback also fails.
    Unrecoverable(usize),
}

impl FsWal {
    /// Open `dir/wal.jsonl`, creating it if absent.
    ///
    /// A torn final line (no trailing newline, unparseable) is an uncommitted
    /// append and is cut off. Any other unparseable line is
    /// [`StoreError::CorruptLog`]. Transaction ids continue after
    /// `min_next_tx` and after the highest id in the log.
    pub fn open(dir: impl AsRef<Path>, compact_threshold: usize, min_next_tx: u64) -> StoreResult<Self> {
        let path = dir.as_ref().join(WAL_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;

        let mut state = WalState::new();
        state.next_tx = state.next_tx.max(min_next_tx);
        let mut offset = 0usize;
        let mut torn_at = None;
        for (i, line) in text.split_inclusive('\n').enumerate() {
            let start = offset;
            offset += line.len();
            let body = line.trim();
            if body.is_empty() {
                continue;
            }
            match serde_json::from_str::<WalEntry>(body) {
                Ok(entry) => state.record(entry),
                Err(_) if offset == text.len() && !line.ends_with('\n') => {
                    torn_at = Some(start);
                }
                Err(e) => {
                    return Err(StoreError::CorruptLog {
                        path,
                        line: i + 1,
                        reason: e.to_string(),
                    })
                }
            }
        }
        if let Some(len) = torn_at {
            warn!(path = %path.display(), offset = len, "Dropping torn write-ahead log tail");
            file.set_len(len as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        debug!(
            path = %path.display(),
            pending = state.pending.len(),
            next_tx = state.next_tx,
            "Opened write-ahead log"
        );
        Ok(Self {
            path,
            file: Mutex::new(file),
            state: Mutex::new(state),
            compact_threshold,
            poisoned: AtomicBool::new(false),
            #[cfg(test)]
            fault: Mutex::new(None),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once a failed append could not be rolled back.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn append(&self, entry: WalEntry) -> StoreResult<()> {
        let mut line = serde_json::to_vec(&entry).map_err(StoreError::serialization)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        if self.is_poisoned() {
            return Err(StoreError::WalPoisoned {
                path: self.path.clone(),
            });
        }
        let start = file.metadata()?.len();
        if let Err(e) = self.write_line(&mut file, &line) {
            self.roll_back(&file, start, &e);
            return Err(e.into());
        }
        self.state.lock().record(entry);
        Ok(())
    }

    fn write_line(&self, file: &mut File, line: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        if let Some(fault) = *self.fault.lock() {
            let written = match fault {
                AppendFault::ShortWrite(n) | AppendFault::Unrecoverable(n) => n.min(line.len()),
                AppendFault::Sync => line.len(),
            };
            file.write_all(&line[..written])?;
            return Err(std::io::Error::other("injected append failure"));
        }
        file.write_all(line)?;
        file.sync_data()
    }

    /// Cut the file back to `len` after a failed append.
    fn roll_back(&self, file: &File, len: u64, cause: &std::io::Error) {
        let truncated = self.truncate_to(file, len);
        match truncated {
            Ok(()) => warn!(path = %self.path.display(), offset = len, error = %cause, "Rolled back failed write-ahead log append"),
            Err(e) => {
                self.poisoned.store(true, Ordering::Release);
                error!(
                    path = %self.path.display(),
                    offset = len,
                    error = %cause,
                    rollback_error = %e,
                    "Write-ahead log append could not be rolled back; refusing further entries"
                );
            }
        }
    }

    fn truncate_to(&self, file: &File, len: u64) -> std::io::Result<()> {
        #[cfg(test)]
        if let Some(AppendFault::Unrecoverable(_)) = *self.fault.lock() {
            return Err(std::io::Error::other("injected truncate failure"));
        }
        file.set_len(len)?;
        file.sync_all()
    }

    #[cfg(test)]
    fn inject(&self, fault: Option<AppendFault>) {
        *self.fault.lock() = fault;
    }
}

impl WriteAheadLog for FsWal {
    fn next_tx(&self) -> u64 {
        self.state.lock().allocate()
    }

    fn begin(&self, tx: u64, ops: &[WalOp]) -> StoreResult<()> {
        self.append(WalEntry::Begin { tx, ops: ops.to_vec() })
    }

    fn complete(&self, tx: u64) -> StoreResult<()> {
        self.append(WalEntry::Done { tx })
    }

    fn pending(&self) -> Vec<PendingTx> {
        self.state.lock().pending()
    }

    fn compact(&self) -> StoreResult<bool> {
        let file = self.file.lock();
        let mut state = self.state.lock();
        if self.is_poisoned() || !state.pending.is_empty() || state.lines < self.compact_threshold {
            return Ok(false);
        }
        file.set_len(0)?;
        file.sync_all()?;
        if let Some(parent) = self.path.parent() {
            fsync_dir(parent);
        }
        debug!(lines = state.lines, "Compacted write-ahead log");
        state.lines = 0;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryContentStore;
    use crate::metadata::MemoryMetadataStore;
    use std::fs;
    use tempfile::TempDir;

    fn publish_op(source: &str, payload: &[u8]) -> (ArtifactKey, ContentFingerprint, Vec<WalOp>) {
        let key = ArtifactKey::for_source(ArtifactKind::RawPage, source);
        let fp = ContentFingerprint::of(payload);
        let ops = vec![
            WalOp::Publish { key, fingerprint: fp },
            WalOp::PutRecords {
                records: vec![(key, MetadataRecord::owner("a.html", source, fp))],
            },
            WalOp::IndexInsert {
                kind: key.kind,
                fingerprint: fp,
                owner: key.id,
            },
        ];
        (key, fp, ops)
    }

    #[test]
    fn test_entry_json_shape() {
        let line = serde_json::to_string(&WalEntry::Done { tx: 4 }).unwrap();
        assert_eq!(line, r#"{"entry":"done","tx":4}"#);
        let key = ArtifactKey::for_source(ArtifactKind::Document, "https://u.tg/x.pdf");
        let op = serde_json::to_value(WalOp::DeleteArtifact { key }).unwrap();
        assert_eq!(op["op"], "delete_artifact");
        assert_eq!(op["key"], key.to_string());
    }

    #[test]
    fn test_begin_without_done_is_pending() {
        let wal = MemoryWal::default();
        let tx = wal.next_tx();
        let (_, _, ops) = publish_op("https://u.tg/a", b"x");
        wal.begin(tx, &ops).unwrap();
        assert_eq!(wal.pending(), vec![PendingTx { tx, ops }]);
        wal.complete(tx).unwrap();
        assert!(wal.pending().is_empty());
        assert_eq!(wal.next_tx(), tx + 1);
    }

    #[test]
    fn test_fs_wal_pending_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let (_, _, ops) = publish_op("https://u.tg/a", b"x");
        {
            let wal = FsWal::open(dir.path(), 1024, 1).unwrap();
            let done = wal.next_tx();
            wal.begin(done, &ops).unwrap();
            wal.complete(done).unwrap();
            let open = wal.next_tx();
            wal.begin(open, &ops).unwrap();
        }
        let wal = FsWal::open(dir.path(), 1024, 1).unwrap();
        let pending = wal.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tx, 2);
        assert_eq!(wal.next_tx(), 3);
    }

    #[test]
    fn test_fs_wal_respects_min_next_tx() {
        let dir = TempDir::new().unwrap();
        let wal = FsWal::open(dir.path(), 1024, 40).unwrap();
        assert_eq!(wal.next_tx(), 40);
    }

    #[test]
    fn test_fs_wal_drops_torn_tail() {
        let dir = TempDir::new().unwrap();
        {
            let wal = FsWal::open(dir.path(), 1024, 1).unwrap();
            let tx = wal.next_tx();
            wal.begin(tx, &[]).unwrap();
            wal.complete(tx).unwrap();
        }
        let path = dir.path().join(WAL_FILE);
        let mut text = fs::read_to_string(&path).unwrap();
        text.push_str(r#"{"entry":"begin","tx":2,"ops":[{"op":"pub"#);
        fs::write(&path, &text).unwrap();

        let wal = FsWal::open(dir.path(), 1024, 1).unwrap();
        assert!(wal.pending().is_empty());
        let reread = fs::read_to_string(&path).unwrap();
        assert!(reread.ends_with('\n'));
        assert_eq!(reread.lines().count(), 2);
    }

    #[test]
    fn test_fs_wal_corrupt_middle_line_is_error() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(WAL_FILE),
            "{\"entry\":\"done\",\"tx\":1}\nnot json\n{\"entry\":\"done\",\"tx\":2}\n",
        )
        .unwrap();
        match FsWal::open(dir.path(), 1024, 1) {
            Err(StoreError::CorruptLog { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected CorruptLog, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_compact_waits_for_pending() {
        let dir = TempDir::new().unwrap();
        let wal = FsWal::open(dir.path(), 2, 1).unwrap();
        let tx = wal.next_tx();
        wal.begin(tx, &[]).unwrap();
        let other = wal.next_tx();
        wal.begin(other, &[]).unwrap();
        wal.complete(tx).unwrap();
        assert!(!wal.compact().unwrap());
        wal.complete(other).unwrap();
        assert!(wal.compact().unwrap());
        assert_eq!(fs::metadata(wal.path()).unwrap().len(), 0);
        // appends after compaction still land in the file
        let next = wal.next_tx();
        wal.begin(next, &[]).unwrap();
        assert!(fs::metadata(wal.path()).unwrap().len() > 0);
    }

    #[test]
    fn test_replay_applies_pending_steps() {
        let content = MemoryContentStore::new();
        let metadata = MemoryMetadataStore::new();
        let index = ContentIndex::new();
        let wal = MemoryWal::default();

        let tx = wal.next_tx();
        let (key, fp, ops) = publish_op("https://u.tg/a", b"Hello University");
        content.stage(tx, b"Hello University").unwrap();
        wal.begin(tx, &ops).unwrap();

        assert_eq!(replay(&wal, &content, &metadata, &index).unwrap().applied, 1);
        assert_eq!(content.marker(&key).unwrap(), Some(fp));
        assert!(metadata.get(&key).unwrap().is_some());
        assert_eq!(index.lookup(key.kind, &fp).unwrap(), Some(key.id));
        assert!(wal.pending().is_empty());

        // replaying the same steps again changes nothing
        apply(tx, &ops, &content, &metadata, &index).unwrap();
        assert_eq!(content.read(&key).unwrap().unwrap(), b"Hello University");
    }

    #[test]
    fn test_replay_stops_at_unappliable_transaction() {
        let content = MemoryContentStore::new();
        let metadata = MemoryMetadataStore::new();
        let index = ContentIndex::new();
        let wal = MemoryWal::default();

        // Committed without its staged payload.
        let broken = wal.next_tx();
        let (key, _, ops) = publish_op("https://u.tg/a", b"lost");
        wal.begin(broken, &ops).unwrap();
        let later = wal.next_tx();
        let (_, _, later_ops) = publish_op("https://u.tg/b", b"fine");
        content.stage(later, b"fine").unwrap();
        wal.begin(later, &later_ops).unwrap();

        let outcome = replay(&wal, &content, &metadata, &index).unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.stalled.as_ref().map(|(tx, _)| *tx), Some(broken));
        assert_eq!(wal.pending().len(), 2);
        assert!(metadata.get(&key).unwrap().is_none());
        match outcome.into_result() {
            Err(StoreError::PendingTransaction { tx, .. }) => assert_eq!(tx, broken),
            other => panic!("expected PendingTransaction, got {:?}", other),
        }
    }

    #[test]
    fn test_short_append_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let (_, _, ops) = publish_op("https://u.tg/a", b"x");
        let wal = FsWal::open(dir.path(), 1024, 1).unwrap();
        let first = wal.next_tx();
        wal.begin(first, &ops).unwrap();
        let len = fs::metadata(wal.path()).unwrap().len();

        wal.inject(Some(AppendFault::ShortWrite(9)));
        assert!(wal.complete(first).is_err());
        assert_eq!(fs::metadata(wal.path()).unwrap().len(), len);
        assert_eq!(wal.pending().len(), 1);
        assert!(!wal.is_poisoned());

        wal.inject(None);
        wal.complete(first).unwrap();
        drop(wal);
        let reopened = FsWal::open(dir.path(), 1024, 1).unwrap();
        assert!(reopened.pending().is_empty());
    }

    #[test]
    fn test_unsynced_begin_is_not_left_committed() {
        let dir = TempDir::new().unwrap();
        let (_, _, ops) = publish_op("https://u.tg/a", b"x");
        {
            let wal = FsWal::open(dir.path(), 1024, 1).unwrap();
            wal.inject(Some(AppendFault::Sync));
            let tx = wal.next_tx();
            assert!(wal.begin(tx, &ops).is_err());
            assert!(wal.pending().is_empty());
            assert_eq!(fs::metadata(wal.path()).unwrap().len(), 0);
        }
        let wal = FsWal::open(dir.path(), 1024, 1).unwrap();
        assert!(wal.pending().is_empty());
    }

    #[test]
    fn test_failed_rollback_poisons_log() {
        let dir = TempDir::new().unwrap();
        let wal = FsWal::open(dir.path(), 1, 1).unwrap();
        wal.inject(Some(AppendFault::Unrecoverable(5)));
        let tx = wal.next_tx();
        assert!(matches!(wal.begin(tx, &[]), Err(StoreError::Io(_))));
        assert!(wal.is_poisoned());

        wal.inject(None);
        let next = wal.next_tx();
        assert!(matches!(wal.begin(next, &[]), Err(StoreError::WalPoisoned { .. })));
        assert!(!wal.compact().unwrap());
        drop(wal);

        // Reopening drops the torn tail and accepts entries again.
        let wal = FsWal::open(dir.path(), 1, 1).unwrap();
        assert!(!wal.is_poisoned());
        let tx = wal.next_tx();
        wal.begin(tx, &[]).unwrap();
        wal.complete(tx).unwrap();
    }
}
