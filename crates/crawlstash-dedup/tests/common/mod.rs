//! Common fixtures for crawlstash integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use std::sync::Arc;

use crawlstash_dedup::{
    ArtifactKey, ArtifactKind, ContentFingerprint, ContentStore, DedupStore, IdentifierFingerprint,
    MemoryContentStore, MemoryMetadataStore, MemoryWal, StoreConfig, StoreError, StoreResult,
};
use tempfile::TempDir;

pub const HTML: ArtifactKind = ArtifactKind::RawPage;

/// Config with short lock timeouts and backoff for fast tests.
pub fn fast_config(root: &std::path::Path) -> StoreConfig {
    StoreConfig {
        lock_timeout_ms: 2_000,
        backoff_base_ms: 1,
        max_attempts: 20,
        ..StoreConfig::with_root(root)
    }
}

/// A filesystem store in a fresh temporary directory.
pub async fn fs_store() -> (TempDir, DedupStore) {
    let dir = TempDir::new().unwrap();
    let store = DedupStore::open(fast_config(dir.path())).await.unwrap();
    (dir, store)
}

pub fn id(source: &str) -> IdentifierFingerprint {
    IdentifierFingerprint::of_source(source)
}

pub fn key(source: &str) -> ArtifactKey {
    ArtifactKey::for_source(HTML, source)
}

pub fn fp(payload: &[u8]) -> ContentFingerprint {
    ContentFingerprint::of(payload)
}

fn injected() -> StoreError {
    StoreError::Io(io::Error::new(io::ErrorKind::Other, "injected failure"))
}

/// Memory content store that fails, panics in or slows down staging, or
/// fails publishing, on demand.
#[derive(Default)]
pub struct FlakyContentStore {
    pub inner: MemoryContentStore,
    pub fail_stage: AtomicBool,
    pub fail_publish: AtomicBool,
    pub panic_stage: AtomicBool,
    pub stage_delay_ms: AtomicU64,
}

impl FlakyContentStore {
    pub fn set_fail_stage(&self, on: bool) {
        self.fail_stage.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, on: bool) {
        self.fail_publish.store(on, Ordering::SeqCst);
    }

    /// Panic right after the payload is staged.
    pub fn set_panic_stage(&self, on: bool) {
        self.panic_stage.store(on, Ordering::SeqCst);
    }

    /// Block every `stage` call for `delay`.
    pub fn set_stage_delay(&self, delay: Duration) {
        self.stage_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

impl ContentStore for FlakyContentStore {
    fn put(&self, key: &ArtifactKey, payload: &[u8], fingerprint: &ContentFingerprint) -> StoreResult<()> {
        self.inner.put(key, payload, fingerprint)
    }

    fn delete(&self, key: &ArtifactKey) -> StoreResult<()> {
        self.inner.delete(key)
    }

    fn exists(&self, key: &ArtifactKey) -> StoreResult<bool> {
        self.inner.exists(key)
    }

    fn marker(&self, key: &ArtifactKey) -> StoreResult<Option<ContentFingerprint>> {
        self.inner.marker(key)
    }

    fn read(&self, key: &ArtifactKey) -> StoreResult<Option<Vec<u8>>> {
        self.inner.read(key)
    }

    fn payload_len(&self, key: &ArtifactKey) -> StoreResult<Option<u64>> {
        self.inner.payload_len(key)
    }

    fn keys(&self, kind: ArtifactKind) -> StoreResult<Vec<IdentifierFingerprint>> {
        self.inner.keys(kind)
    }

    fn marker_keys(&self, kind: ArtifactKind) -> StoreResult<Vec<IdentifierFingerprint>> {
        self.inner.marker_keys(kind)
    }

    fn isolate(&self, key: &ArtifactKey) -> StoreResult<()> {
        self.inner.isolate(key)
    }

    fn stage(&self, tx: u64, payload: &[u8]) -> StoreResult<()> {
        let delay = self.stage_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.fail_stage.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.stage(tx, payload)?;
        if self.panic_stage.load(Ordering::SeqCst) {
            panic!("injected panic after staging tx {}", tx);
        }
        Ok(())
    }

    fn publish(&self, tx: u64, key: &ArtifactKey, fingerprint: &ContentFingerprint) -> StoreResult<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.publish(tx, key, fingerprint)
    }

    fn discard_staged(&self, tx: u64) -> StoreResult<()> {
        self.inner.discard_staged(tx)
    }

    fn staged(&self) -> StoreResult<Vec<u64>> {
        self.inner.staged()
    }
}

/// An in-memory store over a [`FlakyContentStore`].
pub fn flaky_store() -> (Arc<FlakyContentStore>, DedupStore) {
    let content = Arc::new(FlakyContentStore::default());
    let store = DedupStore::with_backends(
        fast_config(std::path::Path::new("unused")),
        content.clone(),
        Arc::new(MemoryMetadataStore::new()),
        Arc::new(MemoryWal::default()),
    )
    .unwrap();
    (content, store)
}
