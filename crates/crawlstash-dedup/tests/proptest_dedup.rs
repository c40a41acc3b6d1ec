//! Property-based tests for the dedup store using proptest.
//!
//! Random ingest sequences over a small pool of identifiers and payloads
//! must leave at most one owner per content, every duplicate pointing at a
//! live owner with the same content, and the index agreeing with metadata.

use std::collections::HashMap;

use crawlstash_dedup::{ArtifactKey, ArtifactKind, ContentStore, Decision, DedupStore, MetadataStore, StoreConfig};
use proptest::prelude::*;

const SOURCES: [&str; 4] = ["https://u.tg/a", "https://u.tg/b", "https://u.tg/c", "https://u.tg/d"];
const PAYLOADS: [&[u8]; 3] = [b"alpha", b"beta", b"gamma"];

fn any_kind() -> impl Strategy<Value = ArtifactKind> {
    prop_oneof![Just(ArtifactKind::RawPage), Just(ArtifactKind::Document)]
}

fn any_step() -> impl Strategy<Value = (usize, ArtifactKind, usize)> {
    (0..SOURCES.len(), any_kind(), 0..PAYLOADS.len())
}

fn assert_invariants(store: &DedupStore) {
    let metadata = store.engine().metadata();
    let content = store.engine().content();
    let index = store.engine().index();
    let records = metadata.records().unwrap();
    let by_key: HashMap<ArtifactKey, _> = records.iter().cloned().collect();

    let mut owners = HashMap::new();
    for (key, record) in &records {
        match record.duplicate_of {
            None => {
                let previous = owners.insert((key.kind, record.content_fingerprint), key.id);
                assert!(previous.is_none(), "two owners for one content");
                assert_eq!(content.marker(key).unwrap(), Some(record.content_fingerprint));
                assert_eq!(
                    index.lookup(key.kind, &record.content_fingerprint).unwrap(),
                    Some(key.id)
                );
            }
            Some(owner) => {
                let owner_record = &by_key[&ArtifactKey::new(key.kind, owner)];
                assert!(owner_record.duplicate_of.is_none(), "chained duplicate");
                assert_eq!(owner_record.content_fingerprint, record.content_fingerprint);
                assert!(!content.exists(key).unwrap(), "artifact under duplicate record");
            }
        }
    }
    assert_eq!(index.len(), owners.len());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_ingest_sequences_keep_one_owner(steps in proptest::collection::vec(any_step(), 1..24)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let store = DedupStore::in_memory(StoreConfig::default()).unwrap();
            for (source, kind, payload) in steps {
                store.ingest(SOURCES[source], kind, PAYLOADS[payload], None).await.unwrap();
                assert_invariants(&store);
            }
            assert!(store.check(true).await.unwrap().is_empty());
        });
    }

    #[test]
    fn prop_repeated_ingest_is_idempotent(source in 0..SOURCES.len(), payload in 0..PAYLOADS.len(), kind in any_kind()) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let store = DedupStore::in_memory(StoreConfig::default()).unwrap();
            let first = store.ingest(SOURCES[source], kind, PAYLOADS[payload], None).await.unwrap();
            assert_eq!(first, Decision::NewSave);
            let record = store.record(SOURCES[source], kind).unwrap();
            for _ in 0..3 {
                let again = store.ingest(SOURCES[source], kind, PAYLOADS[payload], None).await.unwrap();
                assert_eq!(again, Decision::UnchangedSkip);
            }
            assert_eq!(store.record(SOURCES[source], kind).unwrap(), record);
        });
    }
}
