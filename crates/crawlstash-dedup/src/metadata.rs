//! Metadata store for artifact records.
//!
//! One record per artifact key, saying which content the identifier currently
//! carries and whether it owns that content or duplicates another owner. The
//! JSON backend keeps the whole map in a single `metadata.json` with the same
//! field names the crawler pipeline has always written. Files the pipeline
//! wrote key records by bare identifier hash; those keys are scoped to a kind
//! on load and written back in `kind/hex` form on the next write.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::content::write_atomic;
use crate::digest::{ContentFingerprint, IdentifierFingerprint};
use crate::error::{StoreError, StoreResult};
use crate::kind::{ArtifactKey, ArtifactKind};

/// File name of the metadata map under the store root.
pub const METADATA_FILE: &str = "metadata.json";

/// Metadata record of one artifact key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// File name derived from the source identifier.
    pub original_name: String,
    /// Source identifier (URL) as given to `ingest`.
    #[serde(alias = "url", deserialize_with = "null_as_empty")]
    pub source_identifier: String,
    /// Fingerprint of the content this identifier currently carries.
    #[serde(alias = "content_hash")]
    pub content_fingerprint: ContentFingerprint,
    /// Owner of the content when this record is a duplicate.
    pub duplicate_of: Option<IdentifierFingerprint>,
    /// Time of the last decision that rewrote this record.
    pub timestamp: DateTime<Utc>,
}

fn null_as_empty<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl MetadataRecord {
    /// Record of an owner, timestamped now.
    pub fn owner(
        original_name: impl Into<String>,
        source_identifier: impl Into<String>,
        content_fingerprint: ContentFingerprint,
    ) -> Self {
        Self {
            original_name: original_name.into(),
            source_identifier: source_identifier.into(),
            content_fingerprint,
            duplicate_of: None,
            timestamp: Utc::now(),
        }
    }

    /// Record of a duplicate of `owner`, timestamped now.
    pub fn duplicate(
        original_name: impl Into<String>,
        source_identifier: impl Into<String>,
        content_fingerprint: ContentFingerprint,
        owner: IdentifierFingerprint,
    ) -> Self {
        Self {
            duplicate_of: Some(owner),
            ..Self::owner(original_name, source_identifier, content_fingerprint)
        }
    }

    /// True when this record points at another owner.
    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }
}

/// Records as stored: a sorted map keyed by artifact key.
pub type RecordMap = BTreeMap<ArtifactKey, MetadataRecord>;

/// Records keyed as they appear in the file.
type StoredMap = BTreeMap<String, MetadataRecord>;

/// Scope every stored key, bare identifier hashes included.
fn resolve_keys(stored: StoredMap) -> StoreResult<RecordMap> {
    let mut bare = 0usize;
    let mut map = RecordMap::new();
    for (raw, record) in stored {
        bare += usize::from(!raw.contains('/'));
        let key = ArtifactKey::parse_stored(&raw, &record.original_name)?;
        map.insert(key, record);
    }
    if bare > 0 {
        info!(records = bare, "Scoped bare metadata keys by original name");
    }
    Ok(map)
}

/// Durable artifact key to record map.
///
/// Every write is durable before it returns. Object-safe so the engine can
/// run against the JSON file or an in-memory map.
pub trait MetadataStore: Send + Sync {
    /// Record for `key`, if any.
    fn get(&self, key: &ArtifactKey) -> StoreResult<Option<MetadataRecord>>;

    /// Insert or overwrite the record for `key`.
    fn put(&self, key: ArtifactKey, record: MetadataRecord) -> StoreResult<()> {
        self.put_batch(vec![(key, record)])
    }

    /// Insert or overwrite several records in one durable write.
    fn put_batch(&self, records: Vec<(ArtifactKey, MetadataRecord)>) -> StoreResult<()>;

    /// Remove several records in one durable write. Absent keys are ignored.
    fn remove_batch(&self, keys: &[ArtifactKey]) -> StoreResult<()>;

    /// Every record, sorted by key.
    fn records(&self) -> StoreResult<Vec<(ArtifactKey, MetadataRecord)>>;

    /// Number of records.
    fn len(&self) -> StoreResult<usize>;

    /// True when no record exists.
    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Records of `kind` that duplicate `owner` with `content`, oldest first
    /// (ties broken by identifier).
    fn duplicates_of(
        &self,
        kind: ArtifactKind,
        owner: &IdentifierFingerprint,
        content: &ContentFingerprint,
    ) -> StoreResult<Vec<(ArtifactKey, MetadataRecord)>> {
        let mut deps: Vec<_> = self
            .records()?
            .into_iter()
            .filter(|(key, record)| {
                key.kind == kind
                    && record.duplicate_of.as_ref() == Some(owner)
                    && record.content_fingerprint == *content
            })
            .collect();
        deps.sort_by(|(ka, ra), (kb, rb)| ra.timestamp.cmp(&rb.timestamp).then(ka.id.cmp(&kb.id)));
        Ok(deps)
    }
}

/// In-memory metadata store. Not persisted.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: RwLock<RecordMap>,
}

impl MemoryMetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn get(&self, key: &ArtifactKey) -> StoreResult<Option<MetadataRecord>> {
        Ok(self.records.read().get(key).cloned())
    }

    fn put_batch(&self, records: Vec<(ArtifactKey, MetadataRecord)>) -> StoreResult<()> {
        let mut map = self.records.write();
        for (key, record) in records {
            map.insert(key, record);
        }
        Ok(())
    }

    fn remove_batch(&self, keys: &[ArtifactKey]) -> StoreResult<()> {
        let mut map = self.records.write();
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    fn records(&self) -> StoreResult<Vec<(ArtifactKey, MetadataRecord)>> {
        Ok(self.records.read().iter().map(|(k, r)| (*k, r.clone())).collect())
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.records.read().len())
    }
}

/// Outcome of [`JsonMetadataStore::salvage`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SalvageReport {
    /// Entries that parsed and were kept.
    pub recovered: usize,
    /// Keys (or partial keys) that were dropped.
    pub dropped: Vec<String>,
    /// Copy of the damaged file, when one was made.
    pub backup: Option<PathBuf>,
}

/// Metadata store persisted as a single pretty-printed JSON map, rewritten
/// atomically on every write, with an in-memory cache.
#[derive(Debug)]
pub struct JsonMetadataStore {
    path: PathBuf,
    records: RwLock<RecordMap>,
    /// Serializes writers so readers never wait on file I/O.
    writer: Mutex<()>,
}

impl JsonMetadataStore {
    /// Open `dir/metadata.json`, creating an empty map if absent. A file that
    /// does not parse, or holds a key that is neither `kind/hex` nor a bare
    /// hex identifier, is a [`StoreError::CorruptMetadata`].
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let path = dir.as_ref().join(METADATA_FILE);
        let corrupt = |reason: String| StoreError::CorruptMetadata {
            path: path.clone(),
            reason,
        };
        let records = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => RecordMap::new(),
            Ok(bytes) => serde_json::from_slice::<StoredMap>(&bytes)
                .map_err(|e| corrupt(e.to_string()))
                .and_then(|stored| resolve_keys(stored).map_err(|e| corrupt(e.to_string())))?,
            Err(e) if e.kind() == ErrorKind::NotFound => RecordMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), records = records.len(), "Loaded metadata");
        Ok(Self {
            path,
            records: RwLock::new(records),
            writer: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, map: &RecordMap) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(map).map_err(StoreError::serialization)?;
        write_atomic(&self.path, &json)
    }

    /// Recover every entry of a damaged `dir/metadata.json` that still parses.
    ///
    /// The damaged file is copied to `metadata.json.backup_<YYYYmmdd_HHMMSS>`
    /// first, then rewritten with the surviving entries. A file that already
    /// parses is left untouched.
    pub fn salvage(dir: impl AsRef<Path>) -> StoreResult<SalvageReport> {
        let path = dir.as_ref().join(METADATA_FILE);
        let text = match fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SalvageReport::default()),
            Err(e) => return Err(e.into()),
        };
        if let Ok(map) = serde_json::from_str::<StoredMap>(&text)
            .map_err(StoreError::serialization)
            .and_then(resolve_keys)
        {
            return Ok(SalvageReport {
                recovered: map.len(),
                ..SalvageReport::default()
            });
        }

        let backup = path.with_file_name(format!(
            "{}.backup_{}",
            METADATA_FILE,
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::copy(&path, &backup)?;
        warn!(path = %path.display(), backup = %backup.display(), "Metadata file is corrupt, salvaging entries");

        let (map, dropped) = scan_entries(&text);
        let json = serde_json::to_vec_pretty(&map).map_err(StoreError::serialization)?;
        write_atomic(&path, &json)?;
        info!(recovered = map.len(), dropped = dropped.len(), "Metadata salvage complete");
        Ok(SalvageReport {
            recovered: map.len(),
            dropped,
            backup: Some(backup),
        })
    }
}

/// Line-oriented scan of the pretty-printed layout: each top-level entry
/// opens with `"key": {` and closes with `}` or `},`.
fn scan_entries(text: &str) -> (RecordMap, Vec<String>) {
    let mut map = RecordMap::new();
    let mut dropped = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    let finish = |key: String, body: &[&str], map: &mut RecordMap, dropped: &mut Vec<String>| {
        let object = format!("{{{}}}", body.join("\n"));
        let parsed = serde_json::from_str::<MetadataRecord>(&object)
            .ok()
            .and_then(|r| ArtifactKey::parse_stored(&key, &r.original_name).ok().map(|k| (k, r)));
        match parsed {
            Some((k, record)) => {
                map.insert(k, record);
            }
            None => {
                debug!(key = %key, "Dropping unparseable metadata entry");
                dropped.push(key);
            }
        }
    };

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('"') && trimmed.ends_with('{') {
            if let Some((key, body)) = current.take() {
                finish(key, &body, &mut map, &mut dropped);
            }
            let key = trimmed.split('"').nth(1).unwrap_or_default().to_string();
            current = Some((key, Vec::new()));
        } else if trimmed == "}" || trimmed == "}," {
            if let Some((key, body)) = current.take() {
                finish(key, &body, &mut map, &mut dropped);
            }
        } else if let Some((_, body)) = current.as_mut() {
            body.push(trimmed);
        }
    }
    if let Some((key, body)) = current.take() {
        finish(key, &body, &mut map, &mut dropped);
    }
    (map, dropped)
}

impl MetadataStore for JsonMetadataStore {
    fn get(&self, key: &ArtifactKey) -> StoreResult<Option<MetadataRecord>> {
        Ok(self.records.read().get(key).cloned())
    }

    fn put_batch(&self, records: Vec<(ArtifactKey, MetadataRecord)>) -> StoreResult<()> {
        let _writer = self.writer.lock();
        let mut next = self.records.read().clone();
        for (key, record) in records {
            next.insert(key, record);
        }
        self.persist(&next)?;
        *self.records.write() = next;
        Ok(())
    }

    fn remove_batch(&self, keys: &[ArtifactKey]) -> StoreResult<()> {
        let _writer = self.writer.lock();
        let mut next = self.records.read().clone();
        let before = next.len();
        for key in keys {
            next.remove(key);
        }
        if next.len() == before {
            return Ok(());
        }
        self.persist(&next)?;
        *self.records.write() = next;
        Ok(())
    }

    fn records(&self) -> StoreResult<Vec<(ArtifactKey, MetadataRecord)>> {
        Ok(self.records.read().iter().map(|(k, r)| (*k, r.clone())).collect())
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.records.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn key(source: &str) -> ArtifactKey {
        ArtifactKey::for_source(ArtifactKind::RawPage, source)
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let fp = ContentFingerprint::of(b"Hello University");
        {
            let store = JsonMetadataStore::open(dir.path()).unwrap();
            assert!(store.is_empty().unwrap());
            store
                .put(key("https://u.tg/a"), MetadataRecord::owner("a.html", "https://u.tg/a", fp))
                .unwrap();
        }
        let store = JsonMetadataStore::open(dir.path()).unwrap();
        let record = store.get(&key("https://u.tg/a")).unwrap().unwrap();
        assert_eq!(record.content_fingerprint, fp);
        assert!(!record.is_duplicate());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_record_json_field_names() {
        let owner = IdentifierFingerprint::of_source("https://u.tg/a");
        let record = MetadataRecord::duplicate("b.html", "https://u.tg/b", ContentFingerprint::of(b"x"), owner);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["original_name"], "b.html");
        assert_eq!(value["source_identifier"], "https://u.tg/b");
        assert_eq!(value["duplicate_of"], owner.to_hex());
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_record_accepts_pipeline_field_names() {
        let fp = ContentFingerprint::of(b"x");
        let json = format!(
            r#"{{"original_name":"a.html","url":"https://u.tg/a","content_hash":"{}","duplicate_of":null,"timestamp":"2024-05-01T10:00:00.123456+02:00"}}"#,
            fp
        );
        let record: MetadataRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record.source_identifier, "https://u.tg/a");
        assert_eq!(record.content_fingerprint, fp);
        assert_eq!(record.timestamp.to_rfc3339(), "2024-05-01T08:00:00.123456+00:00");
    }

    #[test]
    fn test_corrupt_file_fails_open() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(METADATA_FILE), b"{\"raw_page/zz\": ").unwrap();
        match JsonMetadataStore::open(dir.path()) {
            Err(StoreError::CorruptMetadata { .. }) => {}
            other => panic!("expected CorruptMetadata, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_duplicates_of_orders_oldest_first() {
        let store = MemoryMetadataStore::new();
        let fp = ContentFingerprint::of(b"shared");
        let owner = key("https://u.tg/a");
        let mut late = MetadataRecord::duplicate("c", "https://u.tg/c", fp, owner.id);
        let early = MetadataRecord::duplicate("b", "https://u.tg/b", fp, owner.id);
        late.timestamp = early.timestamp + Duration::seconds(5);
        store.put(key("https://u.tg/c"), late).unwrap();
        store.put(key("https://u.tg/b"), early).unwrap();
        store
            .put(
                key("https://u.tg/d"),
                MetadataRecord::duplicate("d", "https://u.tg/d", ContentFingerprint::of(b"other"), owner.id),
            )
            .unwrap();
        let deps = store.duplicates_of(ArtifactKind::RawPage, &owner.id, &fp).unwrap();
        let sources: Vec<_> = deps.iter().map(|(_, r)| r.source_identifier.as_str()).collect();
        assert_eq!(sources, vec!["https://u.tg/b", "https://u.tg/c"]);
        assert!(store
            .duplicates_of(ArtifactKind::Document, &owner.id, &fp)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_salvage_keeps_complete_entries() {
        let dir = TempDir::new().unwrap();
        let good = JsonMetadataStore::open(dir.path()).unwrap();
        let fp = ContentFingerprint::of(b"a");
        good.put(key("https://u.tg/a"), MetadataRecord::owner("a.html", "https://u.tg/a", fp))
            .unwrap();
        good.put(key("https://u.tg/b"), MetadataRecord::owner("b.html", "https://u.tg/b", ContentFingerprint::of(b"b")))
            .unwrap();
        drop(good);

        // cut the file in the middle of the second entry
        let path = dir.path().join(METADATA_FILE);
        let text = fs::read_to_string(&path).unwrap();
        let cut = text.rfind("\"timestamp\"").unwrap();
        fs::write(&path, &text[..cut]).unwrap();

        let report = JsonMetadataStore::salvage(dir.path()).unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.dropped.len(), 1);
        assert!(report.backup.as_ref().unwrap().is_file());

        let store = JsonMetadataStore::open(dir.path()).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_salvage_leaves_valid_file_alone() {
        let dir = TempDir::new().unwrap();
        let store = JsonMetadataStore::open(dir.path()).unwrap();
        store
            .put(key("https://u.tg/a"), MetadataRecord::owner("a.html", "https://u.tg/a", ContentFingerprint::of(b"a")))
            .unwrap();
        let report = JsonMetadataStore::salvage(dir.path()).unwrap();
        assert_eq!(report.recovered, 1);
        assert!(report.backup.is_none());
    }

    #[test]
    fn test_pipeline_file_with_bare_keys_loads() {
        let dir = TempDir::new().unwrap();
        let page = IdentifierFingerprint::of_source("https://u.tg/a");
        let doc = IdentifierFingerprint::of_source("https://u.tg/r.pdf");
        let html = ContentFingerprint::of(b"<html>");
        let json = format!(
            r#"{{
  "{page}": {{
    "original_name": "a.html",
    "url": "https://u.tg/a",
    "content_hash": "{html}",
    "duplicate_of": null,
    "timestamp": "2024-05-01T10:00:00.123456+02:00"
  }},
  "{doc}": {{
    "original_name": "r.pdf",
    "url": "https://u.tg/r.pdf",
    "content_hash": "{pdf}",
    "duplicate_of": null,
    "timestamp": "2024-05-01T10:00:01+02:00",
    "status": "corrupted"
  }}
}}"#,
            page = page,
            doc = doc,
            html = html,
            pdf = ContentFingerprint::of(b"%PDF"),
        );
        fs::write(dir.path().join(METADATA_FILE), &json).unwrap();

        let store = JsonMetadataStore::open(dir.path()).unwrap();
        let keys: Vec<_> = store.records().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![
                ArtifactKey::new(ArtifactKind::RawPage, page),
                ArtifactKey::new(ArtifactKind::Document, doc),
            ]
        );
        let record = store.get(&key("https://u.tg/a")).unwrap().unwrap();
        assert_eq!(record.content_fingerprint, html);

        // the next write stores scoped keys
        store.remove_batch(&[ArtifactKey::new(ArtifactKind::Document, doc)]).unwrap();
        let text = fs::read_to_string(dir.path().join(METADATA_FILE)).unwrap();
        assert!(text.contains(&format!("\"raw_page/{}\"", page)));
        assert!(!text.contains("r.pdf"));

        // a truncated pipeline file is salvaged with its bare keys too
        fs::write(dir.path().join(METADATA_FILE), &json[..json.rfind("\"timestamp\"").unwrap()]).unwrap();
        let report = JsonMetadataStore::salvage(dir.path()).unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.dropped, vec![doc.to_hex()]);
    }

    #[test]
    fn test_remove_batch_ignores_absent_keys() {
        let dir = TempDir::new().unwrap();
        let store = JsonMetadataStore::open(dir.path()).unwrap();
        let fp = ContentFingerprint::of(b"a");
        store
            .put_batch(vec![
                (key("https://u.tg/a"), MetadataRecord::owner("a", "https://u.tg/a", fp)),
                (key("https://u.tg/b"), MetadataRecord::duplicate("b", "https://u.tg/b", fp, key("https://u.tg/a").id)),
            ])
            .unwrap();
        store
            .remove_batch(&[key("https://u.tg/b"), key("https://u.tg/ghost")])
            .unwrap();
        drop(store);
        let store = JsonMetadataStore::open(dir.path()).unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert!(store.get(&key("https://u.tg/b")).unwrap().is_none());
    }
}
