use super::{CommitResult, MetadataRecord, RecordStore};
use crate::error::Result;
use crate::event::IdentityKey;
use crate::ordering;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// In-process record store.
///
/// The compare-and-set runs under one lock, which gives the same per-identity
/// linearizability as the database backends within a single process.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<IdentityKey, MetadataRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn insert_unchecked(&self, record: MetadataRecord) {
        self.records.lock().insert(record.identity_key.clone(), record);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get_record(&self, key: &IdentityKey) -> Result<Option<MetadataRecord>> {
        Ok(self.records.lock().get(key).cloned())
    }

    async fn conditional_put(&self, record: &MetadataRecord) -> Result<CommitResult> {
        let mut records = self.records.lock();
        let stored = records.get(&record.identity_key).map(|r| &r.sequencer);

        if ordering::check(&record.sequencer, stored).is_stale() {
            return Ok(CommitResult::Rejected);
        }

        records.insert(record.identity_key.clone(), record.clone());
        Ok(CommitResult::Committed)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| record.expire_at > now);
        Ok((before - records.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
