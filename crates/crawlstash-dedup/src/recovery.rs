//! Startup recovery and integrity checking.
//!
//! [`scan`] runs once per open: it replays the write-ahead log, discards
//! payloads staged by transactions that never committed, rebuilds the
//! content-hash index from owner records, and cross-checks records against
//! stored artifacts. Findings are reported, never repaired here; only
//! warning-level findings can be cleaned up later, through
//! `maintenance::clean_orphans` and `maintenance::isolate_misfiled`.
//!
//! A committed transaction that cannot be applied stays in the log and is
//! reported as an error, so a lenient open still succeeds.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::{info, warn};

use crate::content::ContentStore;
use crate::digest::{ContentFingerprint, IdentifierFingerprint};
use crate::error::StoreResult;
use crate::index::ContentIndex;
use crate::kind::{ArtifactKey, ArtifactKind};
use crate::metadata::{MetadataRecord, MetadataStore};
use crate::wal::{self, PendingTx, WriteAheadLog};

/// Severity level for an integrity finding.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    /// Persisted state contradicts itself; needs an operator.
    Error,
    /// Leftover data that `clean_orphans` may remove.
    Warning,
    /// Informational note.
    Info,
}

impl Severity {
    /// Returns true if this severity is Error.
    pub fn is_error(&self) -> bool {
        matches!(self, Severity::Error)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Info => write!(f, "INFO"),
        }
    }
}

/// Kinds of integrity problems.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// Owner record without a complete stored artifact.
    MissingArtifact {
        /// Owner key.
        key: ArtifactKey,
    },
    /// Owner's marker names other content than its record.
    MarkerMismatch {
        /// Owner key.
        key: ArtifactKey,
        /// Fingerprint on record.
        expected: ContentFingerprint,
        /// Fingerprint in the marker.
        actual: ContentFingerprint,
    },
    /// Owner's payload does not hash to its recorded fingerprint.
    PayloadMismatch {
        /// Owner key.
        key: ArtifactKey,
        /// Fingerprint on record.
        expected: ContentFingerprint,
        /// Digest of the stored bytes.
        actual: ContentFingerprint,
    },
    /// More than one owner record for the same content.
    ConflictingOwners {
        /// Kind partition.
        kind: ArtifactKind,
        /// Contested content.
        fingerprint: ContentFingerprint,
        /// Every identifier claiming ownership.
        owners: Vec<IdentifierFingerprint>,
    },
    /// Duplicate pointing at an identifier with no record.
    DanglingDuplicate {
        /// Duplicate key.
        key: ArtifactKey,
        /// Missing owner.
        owner: IdentifierFingerprint,
    },
    /// Duplicate pointing at another duplicate.
    ChainedDuplicate {
        /// Duplicate key.
        key: ArtifactKey,
        /// Referenced record, itself a duplicate.
        owner: IdentifierFingerprint,
    },
    /// Duplicate whose content differs from its owner's.
    DuplicateContentMismatch {
        /// Duplicate key.
        key: ArtifactKey,
        /// Referenced owner.
        owner: IdentifierFingerprint,
        /// Duplicate's fingerprint.
        expected: ContentFingerprint,
        /// Owner's fingerprint.
        actual: ContentFingerprint,
    },
    /// Payload stored under a duplicate record.
    StrayArtifact {
        /// Duplicate key.
        key: ArtifactKey,
    },
    /// Payload with no record at all.
    OrphanArtifact {
        /// Artifact key.
        key: ArtifactKey,
    },
    /// Marker with no payload and no owner record.
    OrphanMarker {
        /// Artifact key.
        key: ArtifactKey,
    },
    /// Raw page whose leading bytes are a binary format.
    MisfiledArtifact {
        /// Owner key.
        key: ArtifactKey,
        /// Format the leading bytes match.
        signature: BinarySignature,
    },
    /// Committed log transaction whose steps could not be applied.
    UnappliedTransaction {
        /// Transaction id.
        tx: u64,
        /// Why the replay stopped.
        reason: String,
    },
    /// Payload staged by a transaction that never committed.
    DiscardedStaging {
        /// Transaction id.
        tx: u64,
    },
}

/// Binary formats recognised at the start of a raw page.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinarySignature {
    /// `%PDF` magic.
    Pdf,
    /// `PK` magic (zip and office formats).
    Zip,
    /// Mostly control bytes.
    Binary,
}

impl BinarySignature {
    /// Bytes inspected at the start of a payload.
    pub const HEAD_LEN: usize = 10;

    /// Control bytes (other than whitespace) in the head above which a
    /// payload counts as binary.
    const CONTROL_LIMIT: usize = 5;

    /// Classify the leading bytes of a payload. Text, including non-ASCII
    /// UTF-8, is `None`.
    pub fn sniff(payload: &[u8]) -> Option<Self> {
        let head = &payload[..payload.len().min(Self::HEAD_LEN)];
        if head.starts_with(b"%PDF") {
            return Some(BinarySignature::Pdf);
        }
        if head.starts_with(b"PK") {
            return Some(BinarySignature::Zip);
        }
        let control = head
            .iter()
            .filter(|b| (**b < 0x20 && !matches!(**b, b'\t' | b'\n' | b'\r' | 0x0c)) || **b == 0x7f)
            .count();
        (control > Self::CONTROL_LIMIT).then_some(BinarySignature::Binary)
    }

    /// Short name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BinarySignature::Pdf => "pdf",
            BinarySignature::Zip => "zip",
            BinarySignature::Binary => "binary",
        }
    }
}

impl IntegrityIssue {
    /// Severity of this kind of issue.
    pub fn severity(&self) -> Severity {
        match self {
            IntegrityIssue::StrayArtifact { .. }
            | IntegrityIssue::OrphanArtifact { .. }
            | IntegrityIssue::OrphanMarker { .. }
            | IntegrityIssue::MisfiledArtifact { .. } => Severity::Warning,
            IntegrityIssue::DiscardedStaging { .. } => Severity::Info,
            _ => Severity::Error,
        }
    }
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityIssue::MissingArtifact { key } => {
                write!(f, "Owner {} has no stored artifact", key)
            }
            IntegrityIssue::MarkerMismatch { key, expected, actual } => write!(
                f,
                "Marker of {} names {}, record says {}",
                key,
                actual.short(),
                expected.short()
            ),
            IntegrityIssue::PayloadMismatch { key, expected, actual } => write!(
                f,
                "Payload of {} hashes to {}, record says {}",
                key,
                actual.short(),
                expected.short()
            ),
            IntegrityIssue::ConflictingOwners {
                kind,
                fingerprint,
                owners,
            } => write!(
                f,
                "Content {}/{} has {} owners",
                kind,
                fingerprint.short(),
                owners.len()
            ),
            IntegrityIssue::DanglingDuplicate { key, owner } => {
                write!(f, "Duplicate {} points at missing record {}", key, owner.short())
            }
            IntegrityIssue::ChainedDuplicate { key, owner } => {
                write!(f, "Duplicate {} points at duplicate {}", key, owner.short())
            }
            IntegrityIssue::DuplicateContentMismatch {
                key,
                owner,
                expected,
                actual,
            } => write!(
                f,
                "Duplicate {} carries {} but owner {} carries {}",
                key,
                expected.short(),
                owner.short(),
                actual.short()
            ),
            IntegrityIssue::StrayArtifact { key } => {
                write!(f, "Duplicate {} still has a stored artifact", key)
            }
            IntegrityIssue::OrphanArtifact { key } => {
                write!(f, "Artifact {} has no metadata record", key)
            }
            IntegrityIssue::OrphanMarker { key } => {
                write!(f, "Marker {} has no payload", key)
            }
            IntegrityIssue::MisfiledArtifact { key, signature } => {
                write!(f, "Raw page {} holds {} data", key, signature.as_str())
            }
            IntegrityIssue::UnappliedTransaction { tx, reason } => {
                write!(f, "Committed transaction {} cannot be applied: {}", tx, reason)
            }
            IntegrityIssue::DiscardedStaging { tx } => {
                write!(f, "Discarded payload staged by uncommitted transaction {}", tx)
            }
        }
    }
}

/// A single finding of the recovery scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IntegrityFinding {
    /// Severity of this finding.
    pub severity: Severity,
    /// The detected issue.
    pub issue: IntegrityIssue,
}

impl IntegrityFinding {
    /// Finding at the issue's own severity.
    pub fn new(issue: IntegrityIssue) -> Self {
        Self {
            severity: issue.severity(),
            issue,
        }
    }
}

impl std::fmt::Display for IntegrityFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.severity, self.issue)
    }
}

/// Result of a recovery scan.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// All findings.
    pub findings: Vec<IntegrityFinding>,
    /// Log transactions replayed.
    pub replayed: usize,
    /// Metadata records scanned.
    pub records: usize,
    /// Index entries after the rebuild.
    pub index_entries: usize,
    /// Content fingerprints quarantined for conflicting owners.
    pub quarantined: usize,
}

impl RecoveryReport {
    /// Count of error-severity findings.
    pub fn errors(&self) -> usize {
        self.findings.iter().filter(|f| f.severity.is_error()).count()
    }

    /// Count of warning-severity findings.
    pub fn warnings(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
            .count()
    }

    /// Returns true if no errors were found.
    pub fn is_clean(&self) -> bool {
        self.errors() == 0
    }

    /// Error-severity findings only.
    pub fn error_findings(&self) -> Vec<IntegrityFinding> {
        self.findings
            .iter()
            .filter(|f| f.severity.is_error())
            .cloned()
            .collect()
    }
}

/// Replay, discard leftovers, rebuild the index and cross-check.
pub fn scan(
    wal: &dyn WriteAheadLog,
    content: &dyn ContentStore,
    metadata: &dyn MetadataStore,
    index: &ContentIndex,
    verify_payloads: bool,
) -> StoreResult<RecoveryReport> {
    let outcome = wal::replay(wal, content, metadata, index)?;
    let mut report = RecoveryReport {
        replayed: outcome.applied,
        ..RecoveryReport::default()
    };

    let pending = wal.pending();
    if let Some((stalled, reason)) = outcome.stalled {
        for PendingTx { tx, .. } in &pending {
            let reason = if *tx == stalled {
                reason.clone()
            } else {
                format!("queued behind transaction {}", stalled)
            };
            report
                .findings
                .push(IntegrityFinding::new(IntegrityIssue::UnappliedTransaction { tx: *tx, reason }));
        }
    }

    // Payloads of still-pending transactions are kept for the next replay.
    let keep: BTreeSet<u64> = pending.iter().map(|p| p.tx).collect();
    for tx in content.staged()? {
        if keep.contains(&tx) {
            continue;
        }
        content.discard_staged(tx)?;
        report
            .findings
            .push(IntegrityFinding::new(IntegrityIssue::DiscardedStaging { tx }));
    }

    let records = metadata.records()?;
    report.records = records.len();
    rebuild_index(&records, index);
    report.index_entries = index.len();
    report.quarantined = index.quarantined().len();
    report.findings.extend(check_records(content, &records, verify_payloads)?);

    for finding in &report.findings {
        match finding.severity {
            Severity::Error => warn!(finding = %finding, "Integrity error"),
            Severity::Warning => warn!(finding = %finding, "Integrity warning"),
            Severity::Info => info!(finding = %finding, "Recovery note"),
        }
    }
    info!(
        replayed = report.replayed,
        records = report.records,
        index_entries = report.index_entries,
        errors = report.errors(),
        warnings = report.warnings(),
        "Recovery scan complete"
    );
    Ok(report)
}

/// Owners of each `(kind, content)`, in key order.
fn owners_by_content(
    records: &[(ArtifactKey, MetadataRecord)],
) -> BTreeMap<(ArtifactKind, ContentFingerprint), Vec<IdentifierFingerprint>> {
    let mut owners: BTreeMap<_, Vec<_>> = BTreeMap::new();
    for (key, record) in records.iter().filter(|(_, r)| !r.is_duplicate()) {
        owners
            .entry((key.kind, record.content_fingerprint))
            .or_default()
            .push(key.id);
    }
    owners
}

/// Replace the index with one entry per owned content. Content with more
/// than one owner is quarantined instead.
pub fn rebuild_index(records: &[(ArtifactKey, MetadataRecord)], index: &ContentIndex) {
    index.clear();
    for ((kind, fingerprint), owners) in owners_by_content(records) {
        match owners.as_slice() {
            [owner] => {
                index.insert(kind, fingerprint, *owner);
            }
            _ => index.quarantine(kind, fingerprint),
        }
    }
}

/// Cross-check the metadata store against the content store without
/// changing either.
pub fn check(
    content: &dyn ContentStore,
    metadata: &dyn MetadataStore,
    verify_payloads: bool,
) -> StoreResult<Vec<IntegrityFinding>> {
    check_records(content, &metadata.records()?, verify_payloads)
}

fn check_records(
    content: &dyn ContentStore,
    records: &[(ArtifactKey, MetadataRecord)],
    verify_payloads: bool,
) -> StoreResult<Vec<IntegrityFinding>> {
    let mut findings = Vec::new();
    let by_key: HashMap<ArtifactKey, &MetadataRecord> = records.iter().map(|(k, r)| (*k, r)).collect();

    for ((kind, fingerprint), owners) in owners_by_content(records) {
        if owners.len() > 1 {
            findings.push(IntegrityFinding::new(IntegrityIssue::ConflictingOwners {
                kind,
                fingerprint,
                owners,
            }));
        }
    }

    for (key, record) in records {
        match record.duplicate_of {
            None => check_owner(content, key, record, verify_payloads, &mut findings)?,
            Some(owner) => {
                let owner_key = ArtifactKey::new(key.kind, owner);
                match by_key.get(&owner_key) {
                    None => findings.push(IntegrityFinding::new(IntegrityIssue::DanglingDuplicate {
                        key: *key,
                        owner,
                    })),
                    Some(owner_record) if owner_record.is_duplicate() => {
                        findings.push(IntegrityFinding::new(IntegrityIssue::ChainedDuplicate {
                            key: *key,
                            owner,
                        }))
                    }
                    Some(owner_record) if owner_record.content_fingerprint != record.content_fingerprint => {
                        findings.push(IntegrityFinding::new(
                            IntegrityIssue::DuplicateContentMismatch {
                                key: *key,
                                owner,
                                expected: record.content_fingerprint,
                                actual: owner_record.content_fingerprint,
                            },
                        ))
                    }
                    Some(_) => {}
                }
                if content.payload_len(key)?.is_some() {
                    findings.push(IntegrityFinding::new(IntegrityIssue::StrayArtifact { key: *key }));
                }
            }
        }
    }

    for kind in ArtifactKind::ALL {
        let payloads: BTreeSet<_> = content.keys(kind)?.into_iter().collect();
        for id in &payloads {
            let key = ArtifactKey::new(kind, *id);
            if !by_key.contains_key(&key) {
                findings.push(IntegrityFinding::new(IntegrityIssue::OrphanArtifact { key }));
            }
        }
        for id in content.marker_keys(kind)? {
            let key = ArtifactKey::new(kind, id);
            let owned = by_key.get(&key).is_some_and(|r| !r.is_duplicate());
            if !payloads.contains(&id) && !owned {
                findings.push(IntegrityFinding::new(IntegrityIssue::OrphanMarker { key }));
            }
        }
    }
    Ok(findings)
}

fn check_owner(
    content: &dyn ContentStore,
    key: &ArtifactKey,
    record: &MetadataRecord,
    verify_payloads: bool,
    findings: &mut Vec<IntegrityFinding>,
) -> StoreResult<()> {
    let marker = content.marker(key)?;
    let (Some(marker), true) = (marker, content.payload_len(key)?.is_some()) else {
        findings.push(IntegrityFinding::new(IntegrityIssue::MissingArtifact { key: *key }));
        return Ok(());
    };
    if marker != record.content_fingerprint {
        findings.push(IntegrityFinding::new(IntegrityIssue::MarkerMismatch {
            key: *key,
            expected: record.content_fingerprint,
            actual: marker,
        }));
        return Ok(());
    }
    if key.kind == ArtifactKind::RawPage {
        let head = content.head(key, BinarySignature::HEAD_LEN)?.unwrap_or_default();
        if let Some(signature) = BinarySignature::sniff(&head) {
            findings.push(IntegrityFinding::new(IntegrityIssue::MisfiledArtifact { key: *key, signature }));
        }
    }
    if verify_payloads {
        if let Some(payload) = content.read(key)? {
            let actual = ContentFingerprint::of(&payload);
            if actual != record.content_fingerprint {
                findings.push(IntegrityFinding::new(IntegrityIssue::PayloadMismatch {
                    key: *key,
                    expected: record.content_fingerprint,
                    actual,
                }));
            }
        }
    }
    Ok(())
}
