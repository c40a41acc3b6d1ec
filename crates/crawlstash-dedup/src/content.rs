//! Content store: payload bytes and content markers keyed by artifact key.
//!
//! Each kind has a payload namespace and a marker namespace. The marker holds
//! the content fingerprint of the payload and is written after the payload,
//! so a present marker means a complete artifact. Deletion removes the marker
//! first. Payloads for a pending write-ahead log transaction are staged under
//! the transaction id and published into place by rename. Isolated artifacts
//! are moved out of the live namespaces but kept for inspection.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::digest::{ContentFingerprint, IdentifierFingerprint};
use crate::error::{StoreError, StoreResult};
use crate::kind::{ArtifactKey, ArtifactKind};

const STAGING_DIR: &str = "staging";
const STAGED_SUFFIX: &str = "part";
const MARKER_EXTENSION: &str = "hash";
const ISOLATED_DIR: &str = "isolated";

/// Physical persistence of artifact payloads, partitioned by kind.
///
/// Object-safe so the engine can run against the filesystem in production
/// and an in-memory map in tests.
pub trait ContentStore: Send + Sync {
    /// Write payload then marker for `key`, replacing any previous artifact.
    fn put(&self, key: &ArtifactKey, payload: &[u8], fingerprint: &ContentFingerprint) -> StoreResult<()>;

    /// Remove marker then payload. Succeeds if nothing was there.
    fn delete(&self, key: &ArtifactKey) -> StoreResult<()>;

    /// True when both payload and marker are present.
    fn exists(&self, key: &ArtifactKey) -> StoreResult<bool>;

    /// Content marker for `key`, if any.
    fn marker(&self, key: &ArtifactKey) -> StoreResult<Option<ContentFingerprint>>;

    /// Payload bytes for `key`, if any.
    fn read(&self, key: &ArtifactKey) -> StoreResult<Option<Vec<u8>>>;

    /// Payload size in bytes, if present.
    fn payload_len(&self, key: &ArtifactKey) -> StoreResult<Option<u64>>;

    /// At most `len` leading payload bytes, if present.
    fn head(&self, key: &ArtifactKey, len: usize) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.read(key)?.map(|mut payload| {
            payload.truncate(len);
            payload
        }))
    }

    /// Move payload and marker of `key` out of the live namespaces, marker
    /// first. Succeeds if nothing was there.
    fn isolate(&self, key: &ArtifactKey) -> StoreResult<()>;

    /// Identifiers with a payload in the `kind` namespace.
    fn keys(&self, kind: ArtifactKind) -> StoreResult<Vec<IdentifierFingerprint>>;

    /// Identifiers with a marker in the `kind` marker namespace.
    fn marker_keys(&self, kind: ArtifactKind) -> StoreResult<Vec<IdentifierFingerprint>>;

    /// Durably stage a payload for transaction `tx`.
    fn stage(&self, tx: u64, payload: &[u8]) -> StoreResult<()>;

    /// Move the payload staged for `tx` into place under `key` and write its
    /// marker. Idempotent: a second call after success is a no-op.
    fn publish(&self, tx: u64, key: &ArtifactKey, fingerprint: &ContentFingerprint) -> StoreResult<()>;

    /// Drop the payload staged for `tx`, if any.
    fn discard_staged(&self, tx: u64) -> StoreResult<()>;

    /// Transaction ids with a staged payload.
    fn staged(&self) -> StoreResult<Vec<u64>>;

    /// Copy the artifact under `from` to `to`. Idempotent: succeeds without
    /// writing when `to` already carries `fingerprint`.
    fn copy(&self, from: &ArtifactKey, to: &ArtifactKey, fingerprint: &ContentFingerprint) -> StoreResult<()> {
        if self.marker(to)? == Some(*fingerprint) && self.exists(to)? {
            return Ok(());
        }
        let source_marker = self.marker(from)?;
        if source_marker != Some(*fingerprint) {
            return Err(mismatch(from, fingerprint, source_marker));
        }
        let payload = self.read(from)?.ok_or_else(|| mismatch(from, fingerprint, None))?;
        self.put(to, &payload, fingerprint)
    }
}

fn mismatch(key: &ArtifactKey, expected: &ContentFingerprint, actual: Option<ContentFingerprint>) -> StoreError {
    StoreError::ArtifactMismatch {
        key: key.to_string(),
        expected: expected.to_hex(),
        actual: actual.map(|fp| fp.to_hex()).unwrap_or_else(|| "missing".to_string()),
    }
}

/// Finish a publish whose staged payload is already gone: the payload must
/// be in place, so re-verify it and write the marker.
fn finish_publish(
    store: &dyn ContentStore,
    key: &ArtifactKey,
    fingerprint: &ContentFingerprint,
) -> StoreResult<Option<Vec<u8>>> {
    if store.marker(key)? == Some(*fingerprint) {
        return Ok(None);
    }
    match store.read(key)? {
        Some(payload) if ContentFingerprint::of(&payload) == *fingerprint => Ok(Some(payload)),
        Some(payload) => Err(mismatch(key, fingerprint, Some(ContentFingerprint::of(&payload)))),
        None => Err(mismatch(key, fingerprint, None)),
    }
}

/// In-memory content store for tests and dry runs. Not persisted.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    payloads: RwLock<HashMap<ArtifactKey, Vec<u8>>>,
    markers: RwLock<HashMap<ArtifactKey, ContentFingerprint>>,
    staged: RwLock<HashMap<u64, Vec<u8>>>,
    isolated: RwLock<HashMap<ArtifactKey, Vec<u8>>>,
}

impl MemoryContentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a payload without a marker (simulates a crash between the two).
    pub fn put_payload_only(&self, key: &ArtifactKey, payload: &[u8]) {
        self.payloads.write().insert(*key, payload.to_vec());
    }

    /// Write a marker without touching the payload.
    pub fn put_marker_only(&self, key: &ArtifactKey, fingerprint: ContentFingerprint) {
        self.markers.write().insert(*key, fingerprint);
    }

    /// Payload set aside by [`ContentStore::isolate`].
    pub fn isolated_payload(&self, key: &ArtifactKey) -> Option<Vec<u8>> {
        self.isolated.read().get(key).cloned()
    }
}

impl ContentStore for MemoryContentStore {
    fn put(&self, key: &ArtifactKey, payload: &[u8], fingerprint: &ContentFingerprint) -> StoreResult<()> {
        self.payloads.write().insert(*key, payload.to_vec());
        self.markers.write().insert(*key, *fingerprint);
        Ok(())
    }

    fn delete(&self, key: &ArtifactKey) -> StoreResult<()> {
        self.markers.write().remove(key);
        self.payloads.write().remove(key);
        Ok(())
    }

    fn exists(&self, key: &ArtifactKey) -> StoreResult<bool> {
        Ok(self.markers.read().contains_key(key) && self.payloads.read().contains_key(key))
    }

    fn marker(&self, key: &ArtifactKey) -> StoreResult<Option<ContentFingerprint>> {
        Ok(self.markers.read().get(key).copied())
    }

    fn read(&self, key: &ArtifactKey) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.payloads.read().get(key).cloned())
    }

    fn payload_len(&self, key: &ArtifactKey) -> StoreResult<Option<u64>> {
        Ok(self.payloads.read().get(key).map(|p| p.len() as u64))
    }

    fn isolate(&self, key: &ArtifactKey) -> StoreResult<()> {
        self.markers.write().remove(key);
        if let Some(payload) = self.payloads.write().remove(key) {
            self.isolated.write().insert(*key, payload);
        }
        Ok(())
    }

    fn keys(&self, kind: ArtifactKind) -> StoreResult<Vec<IdentifierFingerprint>> {
        let mut ids: Vec<_> = self
            .payloads
            .read()
            .keys()
            .filter(|k| k.kind == kind)
            .map(|k| k.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn marker_keys(&self, kind: ArtifactKind) -> StoreResult<Vec<IdentifierFingerprint>> {
        let mut ids: Vec<_> = self
            .markers
            .read()
            .keys()
            .filter(|k| k.kind == kind)
            .map(|k| k.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn stage(&self, tx: u64, payload: &[u8]) -> StoreResult<()> {
        self.staged.write().insert(tx, payload.to_vec());
        Ok(())
    }

    fn publish(&self, tx: u64, key: &ArtifactKey, fingerprint: &ContentFingerprint) -> StoreResult<()> {
        let staged = self.staged.write().remove(&tx);
        match staged {
            Some(payload) => {
                self.payloads.write().insert(*key, payload);
                self.markers.write().insert(*key, *fingerprint);
            }
            None => {
                if finish_publish(self, key, fingerprint)?.is_some() {
                    self.markers.write().insert(*key, *fingerprint);
                }
            }
        }
        Ok(())
    }

    fn discard_staged(&self, tx: u64) -> StoreResult<()> {
        self.staged.write().remove(&tx);
        Ok(())
    }

    fn staged(&self) -> StoreResult<Vec<u64>> {
        let mut txs: Vec<_> = self.staged.read().keys().copied().collect();
        txs.sort_unstable();
        Ok(txs)
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `dest` via a synced temp file and rename, then sync the
/// parent directory.
pub(crate) fn write_atomic(dest: &Path, bytes: &[u8]) -> StoreResult<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| StoreError::Io(std::io::Error::new(ErrorKind::InvalidInput, "path has no parent")))?;
    let file_name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::Io(std::io::Error::new(ErrorKind::InvalidInput, "path has no file name")))?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}-{}",
        file_name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&tmp, dest) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    fsync_dir(parent);
    Ok(())
}

/// Best effort: not every platform can open a directory for sync.
pub(crate) fn fsync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

fn remove_if_exists(path: &Path) -> StoreResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Rename `from` to `to`, creating the destination directory. Returns false
/// if `from` is absent.
fn move_if_exists(from: &Path, to: &Path) -> StoreResult<bool> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => {
            for dir in [from.parent(), to.parent()].into_iter().flatten() {
                fsync_dir(dir);
            }
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn read_if_exists(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Directory-backed content store.
///
/// Layout under `root`: one payload directory per kind (`raw_pages/<id>.html`,
/// `documents/<id>.bin`, ...), a sibling marker directory per kind
/// (`raw_pages_markers/<id>.hash`, holding the hex content fingerprint), and
/// `staging/<tx>.part` for payloads of in-flight transactions. Isolated
/// artifacts keep the same relative layout under `isolated/`.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    /// Open (creating directories as needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for kind in ArtifactKind::ALL {
            fs::create_dir_all(root.join(kind.dir_name()))?;
            fs::create_dir_all(root.join(kind.marker_dir_name()))?;
        }
        fs::create_dir_all(root.join(STAGING_DIR))?;
        debug!(root = %root.display(), "Opened content store");
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the payload file for `key`.
    pub fn payload_path(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(key.kind.dir_name())
            .join(format!("{}.{}", key.id, key.kind.extension()))
    }

    /// Path of the marker file for `key`.
    pub fn marker_path(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(key.kind.marker_dir_name())
            .join(format!("{}.{}", key.id, MARKER_EXTENSION))
    }

    /// Path an isolated payload of `key` is moved to.
    pub fn isolated_payload_path(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(ISOLATED_DIR)
            .join(key.kind.dir_name())
            .join(format!("{}.{}", key.id, key.kind.extension()))
    }

    fn isolated_marker_path(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(ISOLATED_DIR)
            .join(key.kind.marker_dir_name())
            .join(format!("{}.{}", key.id, MARKER_EXTENSION))
    }

    fn staged_path(&self, tx: u64) -> PathBuf {
        self.root.join(STAGING_DIR).join(format!("{}.{}", tx, STAGED_SUFFIX))
    }

    fn write_marker(&self, key: &ArtifactKey, fingerprint: &ContentFingerprint) -> StoreResult<()> {
        write_atomic(&self.marker_path(key), fingerprint.to_hex().as_bytes())
    }

    fn list_ids(dir: &Path, extension: &str) -> StoreResult<Vec<IdentifierFingerprint>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match IdentifierFingerprint::from_hex(stem) {
                Ok(id) => ids.push(id),
                Err(_) => debug!(path = %path.display(), "Skipping foreign file in content store"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl ContentStore for FsContentStore {
    fn put(&self, key: &ArtifactKey, payload: &[u8], fingerprint: &ContentFingerprint) -> StoreResult<()> {
        write_atomic(&self.payload_path(key), payload)?;
        self.write_marker(key, fingerprint)
    }

    fn delete(&self, key: &ArtifactKey) -> StoreResult<()> {
        remove_if_exists(&self.marker_path(key))?;
        remove_if_exists(&self.payload_path(key))?;
        Ok(())
    }

    fn exists(&self, key: &ArtifactKey) -> StoreResult<bool> {
        Ok(self.marker_path(key).is_file() && self.payload_path(key).is_file())
    }

    fn marker(&self, key: &ArtifactKey) -> StoreResult<Option<ContentFingerprint>> {
        match read_if_exists(&self.marker_path(key))? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                match ContentFingerprint::from_hex(text.trim()) {
                    Ok(fp) => Ok(Some(fp)),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Unparseable content marker");
                        Ok(None)
                    }
                }
            }
            None => Ok(None),
        }
    }

    fn read(&self, key: &ArtifactKey) -> StoreResult<Option<Vec<u8>>> {
        read_if_exists(&self.payload_path(key))
    }

    fn payload_len(&self, key: &ArtifactKey) -> StoreResult<Option<u64>> {
        match fs::metadata(self.payload_path(key)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn head(&self, key: &ArtifactKey, len: usize) -> StoreResult<Option<Vec<u8>>> {
        let file = match File::open(self.payload_path(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut head = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut head)?;
        Ok(Some(head))
    }

    fn isolate(&self, key: &ArtifactKey) -> StoreResult<()> {
        let marker = move_if_exists(&self.marker_path(key), &self.isolated_marker_path(key))?;
        let payload = move_if_exists(&self.payload_path(key), &self.isolated_payload_path(key))?;
        if marker || payload {
            debug!(key = %key, "Isolated artifact");
        }
        Ok(())
    }

    fn keys(&self, kind: ArtifactKind) -> StoreResult<Vec<IdentifierFingerprint>> {
        Self::list_ids(&self.root.join(kind.dir_name()), kind.extension())
    }

    fn marker_keys(&self, kind: ArtifactKind) -> StoreResult<Vec<IdentifierFingerprint>> {
        Self::list_ids(&self.root.join(kind.marker_dir_name()), MARKER_EXTENSION)
    }

    fn stage(&self, tx: u64, payload: &[u8]) -> StoreResult<()> {
        write_atomic(&self.staged_path(tx), payload)
    }

    fn publish(&self, tx: u64, key: &ArtifactKey, fingerprint: &ContentFingerprint) -> StoreResult<()> {
        let staged = self.staged_path(tx);
        if staged.is_file() {
            let dest = self.payload_path(key);
            fs::rename(&staged, &dest)?;
            if let Some(parent) = dest.parent() {
                fsync_dir(parent);
            }
            fsync_dir(&self.root.join(STAGING_DIR));
            return self.write_marker(key, fingerprint);
        }
        if finish_publish(self, key, fingerprint)?.is_some() {
            self.write_marker(key, fingerprint)?;
        }
        Ok(())
    }

    fn discard_staged(&self, tx: u64) -> StoreResult<()> {
        remove_if_exists(&self.staged_path(tx))?;
        Ok(())
    }

    fn staged(&self) -> StoreResult<Vec<u64>> {
        let mut txs = Vec::new();
        for entry in fs::read_dir(self.root.join(STAGING_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STAGED_SUFFIX) {
                continue;
            }
            if let Some(tx) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                txs.push(tx);
            }
        }
        txs.sort_unstable();
        Ok(txs)
    }
}
