//! Metadata record persistence.
//!
//! Every backend implements [`RecordStore::conditional_put`] as a single
//! atomic compare-and-set on the stored sequencer. [`IdempotentStore`] adds
//! the read-side pre-check and caller-supplied timeouts on top; the pre-check
//! only saves extraction work and is never what keeps a stale write out.

#[cfg(test)]
pub(crate) mod contract;
pub mod dynamodb;
pub mod memory;
pub mod postgres;

use crate::document::Fragment;
use crate::error::{Error, Result};
use crate::event::{ChangeEvent, IdentityKey, Sequencer};
use crate::ordering::{self, Freshness};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

pub use self::dynamodb::DynamoDbStore;
pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

/// Persisted state of one object version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub identity_key: IdentityKey,
    pub container: String,
    pub key: String,
    pub version_id: Option<String>,
    /// Sequencer of the last applied event
    pub sequencer: Sequencer,
    pub last_event_time: DateTime<Utc>,
    pub etag: Option<String>,
    pub deleted: bool,
    /// Merged extractor output; `None` once deleted
    pub metadata: Option<serde_json::Value>,
    /// End of the retention horizon
    pub expire_at: DateTime<Utc>,
}

impl MetadataRecord {
    /// Record for a created object carrying freshly extracted metadata
    pub fn created(event: &ChangeEvent, metadata: Fragment, retention: Duration) -> Self {
        Self {
            etag: event.etag.clone(),
            deleted: false,
            metadata: Some(serde_json::Value::Object(metadata)),
            ..Self::base(event, retention)
        }
    }

    /// Tombstone that keeps the sequencer so older creates stay rejected
    pub fn deleted(event: &ChangeEvent, retention: Duration) -> Self {
        Self {
            etag: None,
            deleted: true,
            metadata: None,
            ..Self::base(event, retention)
        }
    }

    fn base(event: &ChangeEvent, retention: Duration) -> Self {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(1));
        Self {
            identity_key: event.identity_key(),
            container: event.container.clone(),
            key: event.key.clone(),
            version_id: event.version_id.clone(),
            sequencer: event.sequencer.clone(),
            last_event_time: event.occurred_at,
            etag: None,
            deleted: false,
            metadata: None,
            expire_at: Utc::now() + retention,
        }
    }
}

/// Outcome of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    Committed,
    /// The stored sequencer is already greater than or equal to the record's
    Rejected,
}

/// Persistent key-value store for metadata records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Backend name for logs
    fn backend(&self) -> &'static str;

    async fn get_record(&self, key: &IdentityKey) -> Result<Option<MetadataRecord>>;

    /// Write `record` iff no record exists for its identity or the stored
    /// sequencer is strictly less than `record.sequencer`, atomically.
    async fn conditional_put(&self, record: &MetadataRecord) -> Result<CommitResult>;

    /// Delete records whose retention horizon has passed; returns the count
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Connectivity check used by the readiness endpoint
    async fn ping(&self) -> Result<()>;
}

/// Ordering-aware access to a [`RecordStore`] with bounded call durations
#[derive(Clone)]
pub struct IdempotentStore {
    store: Arc<dyn RecordStore>,
    timeout: Duration,
}

impl IdempotentStore {
    pub fn new(store: Arc<dyn RecordStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn inner(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Fast-path staleness check against the currently stored record
    #[instrument(skip(self, event), fields(sequencer = %event.sequencer))]
    pub async fn precheck(&self, event: &ChangeEvent) -> Result<Freshness> {
        let key = event.identity_key();
        let stored = self.get(&key).await?;
        let freshness = ordering::check(&event.sequencer, stored.as_ref().map(|r| &r.sequencer));

        debug!(
            identity_key = %key,
            stored_sequencer = ?stored.as_ref().map(|r| r.sequencer.as_str()),
            ?freshness,
            "Ordering pre-check"
        );

        Ok(freshness)
    }

    pub async fn get(&self, key: &IdentityKey) -> Result<Option<MetadataRecord>> {
        with_timeout("record read", self.timeout, self.store.get_record(key)).await
    }

    /// Authoritative conditional commit.
    ///
    /// The write runs on its own task: if the timeout elapses the caller sees
    /// `Timeout`, but the in-flight write still completes atomically.
    #[instrument(skip(self, record), fields(identity_key = %record.identity_key, sequencer = %record.sequencer))]
    pub async fn commit(&self, record: &MetadataRecord) -> Result<CommitResult> {
        let store = self.store.clone();
        let record = record.clone();
        let write = tokio::spawn(async move { store.conditional_put(&record).await });

        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::transport("record store", join_err)),
            Err(_) => Err(Error::Timeout {
                operation: "record commit",
                after: self.timeout,
            }),
        }
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        with_timeout("record purge", self.timeout, self.store.purge_expired(Utc::now())).await
    }

    pub async fn ping(&self) -> Result<()> {
        with_timeout("record store ping", self.timeout, self.store.ping()).await
    }
}

async fn with_timeout<T>(
    operation: &'static str,
    after: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| Error::Timeout { operation, after })?
}
