//! Per-invocation state machine.
//!
//! ```text
//! parse ─▶ pre-check ─▶ extract (create only) ─▶ conditional commit
//!   │          │                 │                      │
//!   ▼          ▼                 ▼                      ▼
//! Failed    Outdated           Failed       Outdated | Updated | Deleted
//! ```
//!
//! Nothing is retried here. Every path is safe to replay, so retries are left
//! to the delivery system.

use crate::document::Fragment;
use crate::error::{Error, Result};
use crate::event::{ChangeEvent, EventKind};
use crate::extraction::Extractor;
use crate::store::{CommitResult, IdempotentStore, MetadataRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

/// Terminal state of one invocation
#[derive(Debug)]
pub enum Outcome {
    /// A record at least as new already exists
    Outdated,
    /// Fresh metadata committed for a created object
    Updated,
    /// Tombstone committed for a deleted object
    Deleted,
    Failed(Error),
}

impl Outcome {
    pub fn action(&self) -> String {
        match self {
            Outcome::Outdated => "Outdated".to_string(),
            Outcome::Updated => "Metadata Updated".to_string(),
            Outcome::Deleted => "Deleted".to_string(),
            Outcome::Failed(err) => err.to_string(),
        }
    }

    /// 400 for events that will never parse, 500 for anything worth retrying
    pub fn status(&self) -> u16 {
        match self {
            Outcome::Failed(err) if err.is_fatal() => 400,
            Outcome::Failed(_) => 500,
            _ => 200,
        }
    }

    fn record_metric(&self) {
        let name = match self {
            Outcome::Outdated => "metadata.events.outdated",
            Outcome::Updated => "metadata.events.updated",
            Outcome::Deleted => "metadata.events.deleted",
            Outcome::Failed(_) => "metadata.events.failed",
        };
        metrics::counter!(name).increment(1);
    }
}

/// Result document returned to the delivery system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub status: u16,
    pub body: ActionBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionBody {
    pub action: String,
}

impl From<&Outcome> for InvocationResult {
    fn from(outcome: &Outcome) -> Self {
        Self {
            status: outcome.status(),
            body: ActionBody {
                action: outcome.action(),
            },
        }
    }
}

/// Processes change notifications into metadata records
pub struct Handler {
    extractor: Arc<dyn Extractor>,
    store: IdempotentStore,
    retention: Duration,
    extraction_timeout: Duration,
}

impl Handler {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        store: IdempotentStore,
        retention: Duration,
        extraction_timeout: Duration,
    ) -> Self {
        Self {
            extractor,
            store,
            retention,
            extraction_timeout,
        }
    }

    pub fn store(&self) -> &IdempotentStore {
        &self.store
    }

    /// Handle one raw notification body
    pub async fn handle(&self, payload: &[u8]) -> Outcome {
        let span = info_span!("invocation", invocation_id = %Uuid::new_v4());

        let outcome = async {
            let outcome = match ChangeEvent::from_slice(payload) {
                Ok(event) => self.process(&event).await.unwrap_or_else(Outcome::Failed),
                Err(err) => Outcome::Failed(err),
            };

            match &outcome {
                Outcome::Failed(err) if err.is_fatal() => {
                    warn!(error = %err, "Rejected notification")
                }
                Outcome::Failed(err) => error!(error = %err, "Invocation failed"),
                other => info!(action = %other.action(), "Invocation finished"),
            }

            outcome
        }
        .instrument(span)
        .await;

        outcome.record_metric();
        outcome
    }

    /// Run a parsed event through pre-check, extraction and commit
    #[instrument(
        skip(self, event),
        fields(identity_key = %event.identity_key(), sequencer = %event.sequencer, kind = ?event.kind)
    )]
    pub async fn process(&self, event: &ChangeEvent) -> Result<Outcome> {
        if self.store.precheck(event).await?.is_stale() {
            info!("Stored record is not older, skipping extraction");
            metrics::counter!("metadata.precheck.skipped").increment(1);
            return Ok(Outcome::Outdated);
        }

        let record = match event.kind {
            EventKind::Created => {
                let metadata = self.extract(event).await?;
                MetadataRecord::created(event, metadata, self.retention)
            }
            EventKind::Deleted => MetadataRecord::deleted(event, self.retention),
        };

        match self.store.commit(&record).await? {
            CommitResult::Rejected => {
                info!("Conditional commit rejected, a newer event won");
                metrics::counter!("metadata.commits.rejected").increment(1);
                Ok(Outcome::Outdated)
            }
            CommitResult::Committed => Ok(match event.kind {
                EventKind::Created => Outcome::Updated,
                EventKind::Deleted => Outcome::Deleted,
            }),
        }
    }

    async fn extract(&self, event: &ChangeEvent) -> Result<Fragment> {
        if !self.extractor.applies_to(event) {
            return Ok(Fragment::new());
        }

        let started = Instant::now();
        let result = tokio::time::timeout(self.extraction_timeout, self.extractor.extract(event))
            .await
            .map_err(|_| Error::Timeout {
                operation: "extraction",
                after: self.extraction_timeout,
            })?;
        metrics::histogram!("metadata.extraction.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(metadata) => Ok(metadata),
            Err(err) if err.is_object_unavailable() => {
                info!(error = %err, "Object unavailable, committing empty metadata");
                Ok(Fragment::new())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{IdentityKey, Sequencer};
    use crate::extraction::MockExtractor;
    use crate::store::{MemoryStore, MockRecordStore};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    const KEY: &str = "photos/cat.jpg";

    /// Tags its output with the event's sequencer
    struct EchoExtractor;

    #[async_trait]
    impl Extractor for EchoExtractor {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn applies_to(&self, _event: &ChangeEvent) -> bool {
            true
        }

        async fn extract(&self, event: &ChangeEvent) -> Result<Fragment> {
            let mut fragment = Fragment::new();
            fragment.insert("seen".to_string(), json!(event.sequencer.as_str()));
            Ok(fragment)
        }
    }

    fn envelope(detail_type: &str, sequencer: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "version": "0",
            "detail-type": detail_type,
            "source": "aws.s3",
            "time": "2024-08-20T20:18:08Z",
            "detail": {
                "bucket": { "name": "input-bucket" },
                "object": {
                    "key": KEY,
                    "etag": "d41d8cd98f00b204e9800998ecf8427e",
                    "sequencer": sequencer
                }
            }
        }))
        .unwrap()
    }

    fn created(sequencer: &str) -> Vec<u8> {
        envelope("Object Created", sequencer)
    }

    fn deleted(sequencer: &str) -> Vec<u8> {
        envelope("Object Deleted", sequencer)
    }

    fn handler_with(extractor: Arc<dyn Extractor>) -> (Handler, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::new());
        let store = IdempotentStore::new(memory.clone(), Duration::from_secs(1));
        let handler = Handler::new(
            extractor,
            store,
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );
        (handler, memory)
    }

    fn identity() -> IdentityKey {
        IdentityKey::from_parts("input-bucket", KEY, None)
    }

    /// Record fields that do not depend on wall-clock time
    async fn snapshot(handler: &Handler) -> Option<(Sequencer, bool, Option<String>, Option<Value>)> {
        handler
            .store()
            .get(&identity())
            .await
            .unwrap()
            .map(|r| (r.sequencer, r.deleted, r.etag, r.metadata))
    }

    #[tokio::test]
    async fn test_create_commits_extracted_metadata() {
        let (handler, _) = handler_with(Arc::new(EchoExtractor));

        let outcome = handler.handle(&created("0A")).await;
        assert!(matches!(outcome, Outcome::Updated));

        let (sequencer, deleted, etag, metadata) = snapshot(&handler).await.unwrap();
        assert_eq!(sequencer.as_str(), "0A");
        assert!(!deleted);
        assert_eq!(etag.as_deref(), Some("d41d8cd98f00b204e9800998ecf8427e"));
        assert_eq!(metadata, Some(json!({ "seen": "0A" })));
    }

    #[tokio::test]
    async fn test_arrival_order_does_not_change_final_record() {
        let (alone, _) = handler_with(Arc::new(EchoExtractor));
        alone.handle(&deleted("0B")).await;
        let expected = snapshot(&alone).await;

        let (in_order, _) = handler_with(Arc::new(EchoExtractor));
        assert!(matches!(in_order.handle(&created("0A")).await, Outcome::Updated));
        assert!(matches!(in_order.handle(&deleted("0B")).await, Outcome::Deleted));

        let (reversed, _) = handler_with(Arc::new(EchoExtractor));
        assert!(matches!(reversed.handle(&deleted("0B")).await, Outcome::Deleted));
        assert!(matches!(reversed.handle(&created("0A")).await, Outcome::Outdated));

        assert_eq!(snapshot(&in_order).await, expected);
        assert_eq!(snapshot(&reversed).await, expected);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_a_no_op() {
        let (handler, memory) = handler_with(Arc::new(EchoExtractor));

        assert!(matches!(handler.handle(&created("0A")).await, Outcome::Updated));
        let first = snapshot(&handler).await;

        assert!(matches!(handler.handle(&created("0A")).await, Outcome::Outdated));
        assert_eq!(snapshot(&handler).await, first);
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_delete_keeps_created_metadata() {
        let (handler, _) = handler_with(Arc::new(EchoExtractor));

        handler.handle(&created("0C")).await;
        assert!(matches!(handler.handle(&deleted("0B")).await, Outcome::Outdated));

        let (sequencer, deleted, _, metadata) = snapshot(&handler).await.unwrap();
        assert_eq!(sequencer.as_str(), "0C");
        assert!(!deleted);
        assert_eq!(metadata, Some(json!({ "seen": "0C" })));
    }

    #[tokio::test]
    async fn test_newer_create_revives_deleted_record() {
        let (handler, _) = handler_with(Arc::new(EchoExtractor));

        handler.handle(&created("0A")).await;
        assert!(matches!(handler.handle(&deleted("0B")).await, Outcome::Deleted));
        let (_, deleted, _, metadata) = snapshot(&handler).await.unwrap();
        assert!(deleted);
        assert_eq!(metadata, None);

        assert!(matches!(handler.handle(&created("0C")).await, Outcome::Updated));
        let (sequencer, deleted, _, metadata) = snapshot(&handler).await.unwrap();
        assert_eq!(sequencer.as_str(), "0C");
        assert!(!deleted);
        assert_eq!(metadata, Some(json!({ "seen": "0C" })));
    }

    #[tokio::test]
    async fn test_unavailable_object_commits_empty_metadata() {
        let mut extractor = MockExtractor::new();
        extractor.expect_applies_to().returning(|_| true);
        extractor.expect_extract().times(1).returning(|event| {
            Err(Error::ObjectUnavailable {
                container: event.container.clone(),
                key: event.key.clone(),
            })
        });
        let (handler, _) = handler_with(Arc::new(extractor));

        assert!(matches!(handler.handle(&created("0A")).await, Outcome::Updated));
        let (_, _, _, metadata) = snapshot(&handler).await.unwrap();
        assert_eq!(metadata, Some(json!({})));
    }

    #[tokio::test]
    async fn test_delete_skips_extraction() {
        let mut extractor = MockExtractor::new();
        extractor.expect_applies_to().never();
        extractor.expect_extract().never();
        let (handler, _) = handler_with(Arc::new(extractor));

        assert!(matches!(handler.handle(&deleted("0A")).await, Outcome::Deleted));
    }

    #[tokio::test]
    async fn test_stale_event_skips_extraction() {
        let mut extractor = MockExtractor::new();
        extractor.expect_applies_to().returning(|_| true);
        extractor
            .expect_extract()
            .times(1)
            .returning(|_| Ok(Fragment::new()));
        let (handler, _) = handler_with(Arc::new(extractor));

        handler.handle(&created("0B")).await;
        assert!(matches!(handler.handle(&created("0A")).await, Outcome::Outdated));
    }

    #[tokio::test]
    async fn test_extractor_failure_fails_without_commit() {
        let mut extractor = MockExtractor::new();
        extractor.expect_applies_to().returning(|_| true);
        extractor
            .expect_extract()
            .returning(|_| Err(Error::transport("rekognition", "throttled")));
        let (handler, memory) = handler_with(Arc::new(extractor));

        let outcome = handler.handle(&created("0A")).await;
        assert!(matches!(outcome, Outcome::Failed(Error::Transport { .. })));
        assert_eq!(outcome.status(), 500);
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn test_slow_extraction_times_out() {
        struct Stuck;

        #[async_trait]
        impl Extractor for Stuck {
            fn name(&self) -> &'static str {
                "stuck"
            }

            fn applies_to(&self, _event: &ChangeEvent) -> bool {
                true
            }

            async fn extract(&self, _event: &ChangeEvent) -> Result<Fragment> {
                futures::future::pending().await
            }
        }

        let store = IdempotentStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(1));
        let handler = Handler::new(
            Arc::new(Stuck),
            store,
            Duration::from_secs(60),
            Duration::from_millis(20),
        );

        let outcome = handler.handle(&created("0A")).await;
        assert!(matches!(
            outcome,
            Outcome::Failed(Error::Timeout { operation: "extraction", .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_input_never_touches_store() {
        let mut records = MockRecordStore::new();
        records.expect_get_record().never();
        records.expect_conditional_put().never();
        let mut extractor = MockExtractor::new();
        extractor.expect_extract().never();

        let handler = Handler::new(
            Arc::new(extractor),
            IdempotentStore::new(Arc::new(records), Duration::from_secs(1)),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );

        for payload in [
            &b"not json"[..],
            br#"{"Records":[{"eventName":"ObjectCreated:Put"}]}"#,
            br#"{"detail-type":"Object Created","time":"2024-08-20T20:18:08Z"}"#,
        ] {
            let outcome = handler.handle(payload).await;
            assert!(matches!(outcome, Outcome::Failed(ref err) if err.is_fatal()));
            assert_eq!(outcome.status(), 400);
        }
    }

    #[test]
    fn test_invocation_result_shape() {
        let result = InvocationResult::from(&Outcome::Updated);
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({ "status": 200, "body": { "action": "Metadata Updated" } })
        );

        assert_eq!(Outcome::Outdated.action(), "Outdated");
        assert_eq!(Outcome::Deleted.action(), "Deleted");

        let failed = Outcome::Failed(Error::MalformedEvent("empty sequencer".to_string()));
        let result = InvocationResult::from(&failed);
        assert_eq!(result.status, 400);
        assert_eq!(result.body.action, "Malformed event: empty sequencer");
    }
}
