//! Behaviour every [`RecordStore`] backend must share, run against each one.

use super::{CommitResult, MetadataRecord, RecordStore};
use crate::document::Fragment;
use crate::event::{test_event, EventKind};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

const TTL: Duration = Duration::from_secs(3600);

/// Object key that no earlier run against a shared backend has used
fn fresh_key() -> String {
    format!("contract/{}.jpg", Uuid::new_v4())
}

fn created(key: &str, sequencer: &str) -> MetadataRecord {
    let mut metadata = Fragment::new();
    metadata.insert("seen".to_string(), json!(sequencer));
    MetadataRecord::created(&test_event(EventKind::Created, key, sequencer), metadata, TTL)
}

fn deleted(key: &str, sequencer: &str) -> MetadataRecord {
    MetadataRecord::deleted(&test_event(EventKind::Deleted, key, sequencer), TTL)
}

async fn put(store: &dyn RecordStore, record: &MetadataRecord) -> CommitResult {
    store.conditional_put(record).await.unwrap()
}

async fn stored(store: &dyn RecordStore, key: &str) -> MetadataRecord {
    let identity = test_event(EventKind::Created, key, "0").identity_key();
    store.get_record(&identity).await.unwrap().unwrap()
}

pub(crate) async fn conditional_put_orders_by_sequencer(store: &dyn RecordStore) {
    let key = fresh_key();

    assert_eq!(put(store, &created(&key, "0B")).await, CommitResult::Committed);
    assert_eq!(put(store, &created(&key, "0B")).await, CommitResult::Rejected);
    assert_eq!(put(store, &created(&key, "0A")).await, CommitResult::Rejected);

    let record = stored(store, &key).await;
    assert_eq!(record.sequencer.as_str(), "0B");
    assert_eq!(record.metadata, Some(json!({ "seen": "0B" })));

    assert_eq!(put(store, &created(&key, "0C")).await, CommitResult::Committed);
    assert_eq!(stored(store, &key).await.sequencer.as_str(), "0C");
}

pub(crate) async fn tombstone_rejects_stale_create(store: &dyn RecordStore) {
    let key = fresh_key();

    put(store, &created(&key, "0A")).await;
    assert_eq!(put(store, &deleted(&key, "0C")).await, CommitResult::Committed);
    assert_eq!(put(store, &created(&key, "0B")).await, CommitResult::Rejected);

    let record = stored(store, &key).await;
    assert!(record.deleted);
    assert_eq!(record.sequencer.as_str(), "0C");
    assert_eq!(record.metadata, None);

    assert_eq!(put(store, &created(&key, "0D")).await, CommitResult::Committed);
    let record = stored(store, &key).await;
    assert!(!record.deleted);
    assert_eq!(record.metadata, Some(json!({ "seen": "0D" })));
}

/// "125" < "13" byte-wise even though 125 > 13 numerically
pub(crate) async fn sequencers_compare_byte_wise(store: &dyn RecordStore) {
    let key = fresh_key();
    assert_eq!(put(store, &created(&key, "13")).await, CommitResult::Committed);
    assert_eq!(put(store, &created(&key, "125")).await, CommitResult::Rejected);
    assert_eq!(stored(store, &key).await.sequencer.as_str(), "13");

    let key = fresh_key();
    assert_eq!(put(store, &created(&key, "125")).await, CommitResult::Committed);
    assert_eq!(put(store, &created(&key, "13")).await, CommitResult::Committed);
    assert_eq!(stored(store, &key).await.sequencer.as_str(), "13");
}

pub(crate) async fn run_all(store: &dyn RecordStore) {
    conditional_put_orders_by_sequencer(store).await;
    tombstone_rejects_stale_create(store).await;
    sequencers_compare_byte_wise(store).await;
}
