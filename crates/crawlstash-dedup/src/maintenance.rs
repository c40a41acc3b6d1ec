//! Store statistics, orphan cleanup and isolation of misfiled raw pages.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::content::ContentStore;
use crate::error::StoreResult;
use crate::index::ContentIndex;
use crate::kind::{ArtifactKey, ArtifactKind};
use crate::metadata::MetadataStore;
use crate::recovery::{self, IntegrityFinding, IntegrityIssue, Severity};
use crate::wal::{self, WalOp, WriteAheadLog};

/// Counts for one kind partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindStats {
    /// Metadata records.
    pub records: usize,
    /// Records owning their content.
    pub owners: usize,
    /// Records pointing at another owner.
    pub duplicates: usize,
    /// Payload files present.
    pub artifacts: usize,
    /// Bytes across present payloads.
    pub stored_bytes: u64,
}

/// Store-wide counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Per-kind breakdown.
    pub kinds: BTreeMap<ArtifactKind, KindStats>,
    /// Entries in the content-hash index.
    pub index_entries: usize,
    /// Quarantined content fingerprints.
    pub quarantined: usize,
}

impl StoreStats {
    /// Records across all kinds.
    pub fn records(&self) -> usize {
        self.kinds.values().map(|k| k.records).sum()
    }

    /// Duplicate records across all kinds.
    pub fn duplicates(&self) -> usize {
        self.kinds.values().map(|k| k.duplicates).sum()
    }

    /// Payload bytes across all kinds.
    pub fn stored_bytes(&self) -> u64 {
        self.kinds.values().map(|k| k.stored_bytes).sum()
    }
}

/// Gather statistics. Reads only.
pub fn stats(
    content: &dyn ContentStore,
    metadata: &dyn MetadataStore,
    index: &ContentIndex,
) -> StoreResult<StoreStats> {
    let mut kinds: BTreeMap<ArtifactKind, KindStats> =
        ArtifactKind::ALL.iter().map(|k| (*k, KindStats::default())).collect();

    for (key, record) in metadata.records()? {
        let entry = kinds.entry(key.kind).or_default();
        entry.records += 1;
        if record.is_duplicate() {
            entry.duplicates += 1;
        } else {
            entry.owners += 1;
        }
    }
    for kind in ArtifactKind::ALL {
        let entry = kinds.entry(kind).or_default();
        for id in content.keys(kind)? {
            entry.artifacts += 1;
            entry.stored_bytes += content
                .payload_len(&ArtifactKey::new(kind, id))?
                .unwrap_or(0);
        }
    }

    Ok(StoreStats {
        kinds,
        index_entries: index.len(),
        quarantined: index.quarantined().len(),
    })
}

/// Outcome of [`clean_orphans`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Warning-level findings that were (or, in a dry run, would be) removed.
    pub removed: Vec<IntegrityFinding>,
    /// Nothing was deleted.
    pub dry_run: bool,
}

/// Remove payloads and markers that no owner record accounts for: orphan
/// artifacts, orphan markers and artifacts left under duplicate records.
/// Error-level findings are never touched. Callers must hold the store
/// exclusively.
pub fn clean_orphans(
    content: &dyn ContentStore,
    metadata: &dyn MetadataStore,
    dry_run: bool,
) -> StoreResult<CleanupReport> {
    let mut removed = Vec::new();
    for finding in recovery::check(content, metadata, false)? {
        if finding.severity != Severity::Warning {
            continue;
        }
        let key = match &finding.issue {
            IntegrityIssue::StrayArtifact { key }
            | IntegrityIssue::OrphanArtifact { key }
            | IntegrityIssue::OrphanMarker { key } => *key,
            _ => continue,
        };
        if !dry_run {
            content.delete(&key)?;
        }
        debug!(key = %key, dry_run, "Removing orphan");
        removed.push(finding);
    }
    info!(removed = removed.len(), dry_run, "Orphan cleanup complete");
    Ok(CleanupReport { removed, dry_run })
}

/// Outcome of [`isolate_misfiled`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IsolationReport {
    /// Misfiled-artifact findings that were (or would be) isolated.
    pub isolated: Vec<IntegrityFinding>,
    /// Metadata records dropped with them: owners and their duplicates.
    pub records_removed: usize,
    /// Nothing was moved.
    pub dry_run: bool,
}

/// Steps isolating one misfiled owner: its artifact moves aside, its record
/// and every duplicate record pointing at it are dropped, and its index
/// entry is released.
fn isolation_ops(metadata: &dyn MetadataStore, key: ArtifactKey) -> StoreResult<Option<Vec<WalOp>>> {
    let Some(record) = metadata.get(&key)?.filter(|r| !r.is_duplicate()) else {
        return Ok(None);
    };
    let mut keys = vec![key];
    keys.extend(
        metadata
            .duplicates_of(key.kind, &key.id, &record.content_fingerprint)?
            .into_iter()
            .map(|(k, _)| k),
    );
    Ok(Some(vec![
        WalOp::IsolateArtifact { key },
        WalOp::RemoveRecords { keys },
        WalOp::IndexRemove {
            kind: key.kind,
            fingerprint: record.content_fingerprint,
            owner: key.id,
        },
    ]))
}

/// Move raw pages whose payload is really a binary format out of the store,
/// one log transaction per owner. A later ingest of the same source starts
/// from scratch. Callers must hold the store exclusively.
pub fn isolate_misfiled(
    content: &dyn ContentStore,
    metadata: &dyn MetadataStore,
    index: &ContentIndex,
    log: &dyn WriteAheadLog,
    dry_run: bool,
) -> StoreResult<IsolationReport> {
    let mut report = IsolationReport {
        dry_run,
        ..IsolationReport::default()
    };
    for finding in recovery::check(content, metadata, false)? {
        let IntegrityIssue::MisfiledArtifact { key, signature } = finding.issue else {
            continue;
        };
        let Some(ops) = isolation_ops(metadata, key)? else {
            continue;
        };
        let records = ops
            .iter()
            .find_map(|op| match op {
                WalOp::RemoveRecords { keys } => Some(keys.len()),
                _ => None,
            })
            .unwrap_or(0);
        if !dry_run {
            let tx = wal::commit(log, content, metadata, index, &ops)?;
            info!(tx, key = %key, signature = signature.as_str(), records, "Isolated misfiled artifact");
        }
        report.records_removed += records;
        report.isolated.push(finding);
    }
    info!(
        isolated = report.isolated.len(),
        records = report.records_removed,
        dry_run,
        "Misfiled artifact isolation complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryContentStore;
    use crate::digest::ContentFingerprint;
    use crate::metadata::{MemoryMetadataStore, MetadataRecord};

    fn setup() -> (MemoryContentStore, MemoryMetadataStore, ArtifactKey, ArtifactKey) {
        let content = MemoryContentStore::new();
        let metadata = MemoryMetadataStore::new();
        let owner = ArtifactKey::for_source(ArtifactKind::RawPage, "https://u.tg/a");
        let fp = ContentFingerprint::of(b"Hello University");
        content.put(&owner, b"Hello University", &fp).unwrap();
        metadata
            .put(owner, MetadataRecord::owner("a.html", "https://u.tg/a", fp))
            .unwrap();
        let orphan = ArtifactKey::for_source(ArtifactKind::Document, "https://u.tg/x.pdf");
        content.put(&orphan, b"%PDF-1.4", &ContentFingerprint::of(b"%PDF-1.4")).unwrap();
        (content, metadata, owner, orphan)
    }

    #[test]
    fn test_stats_counts_per_kind() {
        let (content, metadata, owner, _) = setup();
        let dup = ArtifactKey::for_source(ArtifactKind::RawPage, "https://u.tg/b");
        metadata
            .put(
                dup,
                MetadataRecord::duplicate("b.html", "https://u.tg/b", ContentFingerprint::of(b"Hello University"), owner.id),
            )
            .unwrap();
        let stats = stats(&content, &metadata, &ContentIndex::new()).unwrap();
        let pages = stats.kinds[&ArtifactKind::RawPage];
        assert_eq!(pages.records, 2);
        assert_eq!(pages.owners, 1);
        assert_eq!(pages.duplicates, 1);
        assert_eq!(pages.stored_bytes, 16);
        assert_eq!(stats.kinds[&ArtifactKind::Document].artifacts, 1);
        assert_eq!(stats.records(), 2);
        assert_eq!(stats.stored_bytes(), 16 + 8);
        assert_eq!(stats.kinds.len(), 4);
    }

    #[test]
    fn test_dry_run_deletes_nothing() {
        let (content, metadata, _, orphan) = setup();
        let report = clean_orphans(&content, &metadata, true).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.removed.len(), 1);
        assert!(content.exists(&orphan).unwrap());
    }

    #[test]
    fn test_clean_removes_only_warnings() {
        let (content, metadata, owner, orphan) = setup();
        let missing = ArtifactKey::for_source(ArtifactKind::RawPage, "https://u.tg/gone");
        metadata
            .put(missing, MetadataRecord::owner("gone.html", "https://u.tg/gone", ContentFingerprint::of(b"g")))
            .unwrap();

        let report = clean_orphans(&content, &metadata, false).unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(!content.exists(&orphan).unwrap());
        assert!(content.exists(&owner).unwrap());
        // the owner without an artifact is still an error for an operator
        let remaining = recovery::check(&content, &metadata, false).unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].severity.is_error());
    }

    #[test]
    fn test_isolate_misfiled_drops_owner_and_duplicates() {
        use crate::wal::MemoryWal;

        let (content, metadata, owner, _) = setup();
        let index = ContentIndex::new();
        let pdf = ArtifactKey::for_source(ArtifactKind::RawPage, "https://u.tg/report");
        let dup = ArtifactKey::for_source(ArtifactKind::RawPage, "https://u.tg/report?print=1");
        let fp = ContentFingerprint::of(b"%PDF-1.7 ...");
        content.put(&pdf, b"%PDF-1.7 ...", &fp).unwrap();
        metadata
            .put_batch(vec![
                (pdf, MetadataRecord::owner("report", "https://u.tg/report", fp)),
                (dup, MetadataRecord::duplicate("report", "https://u.tg/report?print=1", fp, pdf.id)),
            ])
            .unwrap();
        index.insert(ArtifactKind::RawPage, fp, pdf.id);
        let wal = MemoryWal::default();

        let dry = isolate_misfiled(&content, &metadata, &index, &wal, true).unwrap();
        assert_eq!(dry.isolated.len(), 1);
        assert_eq!(dry.records_removed, 2);
        assert!(content.exists(&pdf).unwrap());
        assert!(wal.entries().is_empty());

        let done = isolate_misfiled(&content, &metadata, &index, &wal, false).unwrap();
        assert_eq!(done.records_removed, 2);
        assert!(!content.exists(&pdf).unwrap());
        assert_eq!(content.isolated_payload(&pdf).unwrap(), b"%PDF-1.7 ...");
        assert!(metadata.get(&pdf).unwrap().is_none());
        assert!(metadata.get(&dup).unwrap().is_none());
        assert!(metadata.get(&owner).unwrap().is_some());
        assert_eq!(index.lookup(ArtifactKind::RawPage, &fp).unwrap(), None);
        assert!(wal.pending().is_empty());
        // only the orphan document is left for clean_orphans
        let remaining = recovery::check(&content, &metadata, false).unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(matches!(remaining[0].issue, IntegrityIssue::OrphanArtifact { .. }));
    }
}
