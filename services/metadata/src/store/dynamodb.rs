use super::{CommitResult, MetadataRecord, RecordStore};
use crate::config::{load_aws_config, DynamoDbConfig};
use crate::error::{Error, Result};
use crate::event::{IdentityKey, Sequencer};
use async_trait::async_trait;
use aws_sdk_dynamodb::config::Builder as DynamoDbConfigBuilder;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

/// Partition key attribute
const PARTITION_KEY: &str = "s3key";

/// Accept the write only if the item is absent or strictly older
const CONDITION: &str = "attribute_not_exists(s3key) OR :newSeq > sequencer";

type Item = HashMap<String, AttributeValue>;

/// DynamoDB-backed record store.
///
/// Retention is enforced by the table's native TTL on `expire_at`, so
/// [`RecordStore::purge_expired`] is a no-op here.
pub struct DynamoDbStore {
    client: Client,
    table_name: String,
}

impl DynamoDbStore {
    pub async fn new(config: &DynamoDbConfig) -> anyhow::Result<Self> {
        let aws_config = load_aws_config(&config.region).await;

        let mut builder = DynamoDbConfigBuilder::from(&aws_config);
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        info!(table = %config.table_name, region = %config.region, "DynamoDB record store initialized");

        Ok(Self {
            client: Client::from_conf(builder.build()),
            table_name: config.table_name.clone(),
        })
    }
}

#[async_trait]
impl RecordStore for DynamoDbStore {
    fn backend(&self) -> &'static str {
        "dynamodb"
    }

    #[instrument(skip(self), fields(identity_key = %key))]
    async fn get_record(&self, key: &IdentityKey) -> Result<Option<MetadataRecord>> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(PARTITION_KEY, AttributeValue::S(key.as_str().to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| Error::transport("dynamodb", DisplayErrorContext(&e)))?;

        result.item.as_ref().map(item_to_record).transpose()
    }

    #[instrument(skip(self, record), fields(identity_key = %record.identity_key, sequencer = %record.sequencer))]
    async fn conditional_put(&self, record: &MetadataRecord) -> Result<CommitResult> {
        let response = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(record_to_item(record)?))
            .condition_expression(CONDITION)
            .expression_attribute_values(
                ":newSeq",
                AttributeValue::S(record.sequencer.as_str().to_string()),
            )
            .send()
            .await;

        match response {
            Ok(_) => {
                debug!("Conditional put committed");
                Ok(CommitResult::Committed)
            }
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_conditional_check_failed_exception())
                    .unwrap_or(false) =>
            {
                debug!("Conditional put rejected");
                Ok(CommitResult::Rejected)
            }
            Err(err) => Err(Error::transport("dynamodb", DisplayErrorContext(&err))),
        }
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
            .map_err(|e| Error::transport("dynamodb", DisplayErrorContext(&e)))?;
        Ok(())
    }
}

fn record_to_item(record: &MetadataRecord) -> Result<Item> {
    let mut item = HashMap::new();
    item.insert(
        PARTITION_KEY.to_string(),
        AttributeValue::S(record.identity_key.as_str().to_string()),
    );
    item.insert("bucket".to_string(), AttributeValue::S(record.container.clone()));
    item.insert("key".to_string(), AttributeValue::S(record.key.clone()));
    item.insert(
        "sequencer".to_string(),
        AttributeValue::S(record.sequencer.as_str().to_string()),
    );
    item.insert(
        "latest_event_time".to_string(),
        AttributeValue::S(record.last_event_time.to_rfc3339()),
    );
    item.insert(
        "expire_at".to_string(),
        AttributeValue::N(record.expire_at.timestamp().to_string()),
    );
    item.insert("deleted".to_string(), AttributeValue::Bool(record.deleted));

    if let Some(ref version_id) = record.version_id {
        item.insert("version_id".to_string(), AttributeValue::S(version_id.clone()));
    }
    if let Some(ref etag) = record.etag {
        item.insert("etag".to_string(), AttributeValue::S(etag.clone()));
    }
    if let Some(ref metadata) = record.metadata {
        let encoded = serde_json::to_string(metadata).map_err(|e| Error::Decode(e.to_string()))?;
        item.insert("metadata".to_string(), AttributeValue::S(encoded));
    }

    Ok(item)
}

fn item_to_record(item: &Item) -> Result<MetadataRecord> {
    let expire_at = required_n(item, "expire_at")?;
    let expire_at = Utc
        .timestamp_opt(expire_at, 0)
        .single()
        .ok_or_else(|| Error::Decode(format!("invalid expire_at {}", expire_at)))?;

    let last_event_time = DateTime::parse_from_rfc3339(&required_s(item, "latest_event_time")?)
        .map_err(|e| Error::Decode(format!("invalid latest_event_time: {}", e)))?
        .with_timezone(&Utc);

    let metadata = optional_s(item, "metadata")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| Error::Decode(format!("invalid metadata: {}", e)))?;

    let deleted = match item.get("deleted") {
        Some(value) => *value
            .as_bool()
            .map_err(|_| Error::Decode("deleted is not a boolean".to_string()))?,
        None => false,
    };

    Ok(MetadataRecord {
        identity_key: IdentityKey::from_raw(required_s(item, PARTITION_KEY)?),
        container: required_s(item, "bucket")?,
        key: required_s(item, "key")?,
        version_id: optional_s(item, "version_id"),
        sequencer: Sequencer::new(required_s(item, "sequencer")?),
        last_event_time,
        etag: optional_s(item, "etag"),
        deleted,
        metadata,
        expire_at,
    })
}

fn required_s(item: &Item, name: &str) -> Result<String> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| Error::Decode(format!("missing string attribute {}", name)))
}

fn optional_s(item: &Item, name: &str) -> Option<String> {
    item.get(name).and_then(|v| v.as_s().ok()).cloned()
}

fn required_n(item: &Item, name: &str) -> Result<i64> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| Error::Decode(format!("missing numeric attribute {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Fragment;
    use crate::event::{test_event, EventKind};
    use aws_sdk_dynamodb::types::{
        AttributeDefinition, BillingMode, KeySchemaElement, KeyType, ScalarAttributeType,
    };
    use serde_json::json;
    use std::time::Duration;

    fn sample_record() -> MetadataRecord {
        let mut event = test_event(EventKind::Created, "bar.jpg", "0066C4F5D86F2AD5C0");
        event.version_id = Some("v1".to_string());
        let mut metadata = Fragment::new();
        metadata.insert("labels".to_string(), json!([{ "name": "Dog" }]));

        let mut record = MetadataRecord::created(&event, metadata, Duration::from_secs(86_400));
        // Item timestamps have whole-second precision
        record.expire_at = Utc.timestamp_opt(record.expire_at.timestamp(), 0).unwrap();
        record
    }

    #[test]
    fn test_item_layout() {
        let record = sample_record();
        let item = record_to_item(&record).unwrap();

        assert_eq!(
            item.get("s3key").unwrap().as_s().unwrap(),
            record.identity_key.as_str()
        );
        assert_eq!(item.get("bucket").unwrap().as_s().unwrap(), "input-bucket");
        assert_eq!(item.get("sequencer").unwrap().as_s().unwrap(), "0066C4F5D86F2AD5C0");
        assert_eq!(
            item.get("expire_at").unwrap().as_n().unwrap(),
            &record.expire_at.timestamp().to_string()
        );
        assert_eq!(item.get("deleted").unwrap().as_bool().unwrap(), &false);
        assert!(item.get("metadata").unwrap().as_s().unwrap().contains("Dog"));
    }

    #[test]
    fn test_item_mapping_preserves_record() {
        let record = sample_record();
        let decoded = item_to_record(&record_to_item(&record).unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_tombstone_item_has_no_metadata() {
        let event = test_event(EventKind::Deleted, "bar.jpg", "02");
        let item = record_to_item(&MetadataRecord::deleted(&event, Duration::from_secs(60))).unwrap();

        assert!(!item.contains_key("metadata"));
        assert!(!item.contains_key("version_id"));
        assert_eq!(item.get("deleted").unwrap().as_bool().unwrap(), &true);
    }

    #[test]
    fn test_missing_sequencer_fails_to_decode() {
        let mut item = record_to_item(&sample_record()).unwrap();
        item.remove("sequencer");

        assert!(matches!(item_to_record(&item), Err(Error::Decode(_))));
    }

    /// Store on a DynamoDB Local endpoint named by `METADATA_TEST_DYNAMODB_ENDPOINT`.
    ///
    /// Credentials come from the default chain; DynamoDB Local accepts any
    /// `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` pair.
    async fn local_store() -> DynamoDbStore {
        let endpoint = std::env::var("METADATA_TEST_DYNAMODB_ENDPOINT")
            .expect("METADATA_TEST_DYNAMODB_ENDPOINT must point at DynamoDB Local");
        let config = DynamoDbConfig {
            table_name: "metadata-records-test".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: Some(endpoint),
        };
        let store = DynamoDbStore::new(&config).await.unwrap();

        let created = store
            .client
            .create_table()
            .table_name(&store.table_name)
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name(PARTITION_KEY)
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .unwrap(),
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(PARTITION_KEY)
                    .key_type(KeyType::Hash)
                    .build()
                    .unwrap(),
            )
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await;

        if let Err(err) = created {
            let exists = err
                .as_service_error()
                .map(|e| e.is_resource_in_use_exception())
                .unwrap_or(false);
            assert!(exists, "create_table failed: {}", DisplayErrorContext(&err));
        }

        store
    }

    #[tokio::test]
    #[ignore = "requires DynamoDB Local at METADATA_TEST_DYNAMODB_ENDPOINT"]
    async fn test_conditional_put_against_dynamodb_local() {
        let store = local_store().await;
        store.ping().await.unwrap();

        crate::store::contract::run_all(&store).await;
    }

    #[tokio::test]
    #[ignore = "requires DynamoDB Local at METADATA_TEST_DYNAMODB_ENDPOINT"]
    async fn test_stored_item_reads_back() {
        let store = local_store().await;
        let mut event = test_event(
            EventKind::Created,
            &format!("readback/{}.jpg", uuid::Uuid::new_v4()),
            "0066C4F5D86F2AD5C0",
        );
        event.version_id = Some("v1".to_string());
        let mut record = MetadataRecord::created(&event, Fragment::new(), Duration::from_secs(60));
        record.expire_at = Utc.timestamp_opt(record.expire_at.timestamp(), 0).unwrap();

        assert_eq!(
            store.conditional_put(&record).await.unwrap(),
            CommitResult::Committed
        );
        assert_eq!(
            store.get_record(&record.identity_key).await.unwrap(),
            Some(record)
        );
    }
}
