//! Content-hash index: content fingerprint to owning identifier, per kind.
//!
//! Held in memory and rebuilt from the metadata store on every open. Claims
//! are compare-and-set so two writers racing on the same content cannot both
//! become its owner.

use std::collections::HashSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::digest::{ContentFingerprint, IdentifierFingerprint};
use crate::error::{StoreError, StoreResult};
use crate::kind::ArtifactKind;

type IndexKey = (ArtifactKind, ContentFingerprint);

/// Outcome of [`ContentIndex::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller is now the owner.
    Won,
    /// Another identifier already owns this content.
    Lost(IdentifierFingerprint),
}

/// Concurrent content-hash index with a quarantine set of content
/// fingerprints that have conflicting owners on record.
#[derive(Debug, Default)]
pub struct ContentIndex {
    entries: DashMap<IndexKey, IdentifierFingerprint>,
    quarantined: RwLock<HashSet<IndexKey>>,
}

impl ContentIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner of `fingerprint` in `kind`, if any. Quarantined content is an
    /// integrity error.
    pub fn lookup(
        &self,
        kind: ArtifactKind,
        fingerprint: &ContentFingerprint,
    ) -> StoreResult<Option<IdentifierFingerprint>> {
        if self.is_quarantined(kind, fingerprint) {
            return Err(StoreError::Quarantined {
                kind: kind.to_string(),
                fingerprint: fingerprint.to_hex(),
            });
        }
        Ok(self.entries.get(&(kind, *fingerprint)).map(|owner| *owner))
    }

    /// Insert `owner` if no entry exists. Returns the existing owner otherwise.
    pub fn claim(
        &self,
        kind: ArtifactKind,
        fingerprint: ContentFingerprint,
        owner: IdentifierFingerprint,
    ) -> Claim {
        match self.entries.entry((kind, fingerprint)) {
            Entry::Occupied(existing) if *existing.get() == owner => Claim::Won,
            Entry::Occupied(existing) => Claim::Lost(*existing.get()),
            Entry::Vacant(slot) => {
                slot.insert(owner);
                Claim::Won
            }
        }
    }

    /// Set the owner unconditionally. Returns the previous owner.
    pub fn insert(
        &self,
        kind: ArtifactKind,
        fingerprint: ContentFingerprint,
        owner: IdentifierFingerprint,
    ) -> Option<IdentifierFingerprint> {
        self.entries.insert((kind, fingerprint), owner)
    }

    /// Remove the entry only if it still points at `owner`.
    pub fn remove_if(
        &self,
        kind: ArtifactKind,
        fingerprint: &ContentFingerprint,
        owner: &IdentifierFingerprint,
    ) -> bool {
        self.entries
            .remove_if(&(kind, *fingerprint), |_, current| current == owner)
            .is_some()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every entry, sorted.
    pub fn entries(&self) -> Vec<(ArtifactKind, ContentFingerprint, IdentifierFingerprint)> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().0, e.key().1, *e.value()))
            .collect();
        out.sort();
        out
    }

    /// Drop every entry and the quarantine set.
    pub fn clear(&self) {
        self.entries.clear();
        self.quarantined.write().clear();
    }

    /// Refuse further lookups of this content until the next rebuild.
    pub fn quarantine(&self, kind: ArtifactKind, fingerprint: ContentFingerprint) {
        self.entries.remove(&(kind, fingerprint));
        self.quarantined.write().insert((kind, fingerprint));
    }

    /// True when `fingerprint` is quarantined in `kind`.
    pub fn is_quarantined(&self, kind: ArtifactKind, fingerprint: &ContentFingerprint) -> bool {
        self.quarantined.read().contains(&(kind, *fingerprint))
    }

    /// Quarantined entries, sorted.
    pub fn quarantined(&self) -> Vec<(ArtifactKind, ContentFingerprint)> {
        let mut out: Vec<_> = self.quarantined.read().iter().copied().collect();
        out.sort();
        out
    }
}
