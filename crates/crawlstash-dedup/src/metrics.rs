//! Ingest counters for the dedup store.
//!
//! Atomic counters updated on every decision, read back as a serializable
//! snapshot by the operator CLI.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::engine::Decision;

/// Thread-safe decision and retry counters.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    /// NEW_SAVE decisions.
    new_saves: AtomicU64,
    /// UNCHANGED_SKIP decisions.
    unchanged_skips: AtomicU64,
    /// UPDATE_REPLACE decisions.
    update_replaces: AtomicU64,
    /// DUPLICATE_SKIP decisions.
    duplicate_skips: AtomicU64,
    /// Payload bytes written to the content store.
    bytes_stored: AtomicU64,
    /// Payload bytes not written because they were duplicates.
    bytes_deduplicated: AtomicU64,
    /// Owner promotions performed while releasing content.
    promotions: AtomicU64,
    /// Attempts retried after lock contention.
    contention_retries: AtomicU64,
    /// Ingests that failed.
    failures: AtomicU64,
    /// Write-ahead log transactions replayed.
    replays: AtomicU64,
}

impl IngestMetrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one decision for a payload of `payload_len` bytes.
    #[inline]
    pub fn record_decision(&self, decision: Decision, payload_len: u64) {
        match decision {
            Decision::NewSave => {
                self.new_saves.fetch_add(1, Ordering::Relaxed);
                self.bytes_stored.fetch_add(payload_len, Ordering::Relaxed);
            }
            Decision::UpdateReplace => {
                self.update_replaces.fetch_add(1, Ordering::Relaxed);
                self.bytes_stored.fetch_add(payload_len, Ordering::Relaxed);
            }
            Decision::UnchangedSkip => {
                self.unchanged_skips.fetch_add(1, Ordering::Relaxed);
            }
            Decision::DuplicateSkip => {
                self.duplicate_skips.fetch_add(1, Ordering::Relaxed);
                self.bytes_deduplicated.fetch_add(payload_len, Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub(crate) fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_retry(&self) {
        self.contention_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_replays(&self, count: u64) {
        self.replays.fetch_add(count, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            new_saves: self.new_saves.load(Ordering::Relaxed),
            unchanged_skips: self.unchanged_skips.load(Ordering::Relaxed),
            update_replaces: self.update_replaces.load(Ordering::Relaxed),
            duplicate_skips: self.duplicate_skips.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            bytes_deduplicated: self.bytes_deduplicated.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            contention_retries: self.contention_retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
        }
    }
}

/// Serializable counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// NEW_SAVE decisions.
    pub new_saves: u64,
    /// UNCHANGED_SKIP decisions.
    pub unchanged_skips: u64,
    /// UPDATE_REPLACE decisions.
    pub update_replaces: u64,
    /// DUPLICATE_SKIP decisions.
    pub duplicate_skips: u64,
    /// Payload bytes written.
    pub bytes_stored: u64,
    /// Payload bytes skipped as duplicates.
    pub bytes_deduplicated: u64,
    /// Owner promotions.
    pub promotions: u64,
    /// Contention retries.
    pub contention_retries: u64,
    /// Failed ingests.
    pub failures: u64,
    /// Replayed log transactions.
    pub replays: u64,
}

impl MetricsSnapshot {
    /// Total decisions taken.
    pub fn decisions(&self) -> u64 {
        self.new_saves + self.unchanged_skips + self.update_replaces + self.duplicate_skips
    }

    /// Share of ingested bytes that were not stored because of deduplication.
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.bytes_stored + self.bytes_deduplicated;
        if total == 0 {
            0.0
        } else {
            self.bytes_deduplicated as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_decisions() {
        let metrics = IngestMetrics::new();
        metrics.record_decision(Decision::NewSave, 100);
        metrics.record_decision(Decision::DuplicateSkip, 100);
        metrics.record_decision(Decision::UnchangedSkip, 100);
        metrics.record_decision(Decision::UpdateReplace, 50);
        let snap = metrics.snapshot();
        assert_eq!(snap.decisions(), 4);
        assert_eq!(snap.bytes_stored, 150);
        assert_eq!(snap.bytes_deduplicated, 100);
        assert!((snap.dedup_ratio() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_empty_ratio_is_zero() {
        assert_eq!(MetricsSnapshot::default().dedup_ratio(), 0.0);
    }

    #[test]
    fn test_internal_counters() {
        let metrics = IngestMetrics::new();
        metrics.record_retry();
        metrics.record_retry();
        metrics.record_promotion();
        metrics.record_failure();
        metrics.record_replays(3);
        let snap = metrics.snapshot();
        assert_eq!(snap.contention_retries, 2);
        assert_eq!(snap.promotions, 1);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.replays, 3);
    }
}
