use super::{CommitResult, MetadataRecord, RecordStore};
use crate::config::PostgresConfig;
use crate::document;
use crate::error::{Error, Result};
use crate::event::{IdentityKey, Sequencer};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Insert, or overwrite only a row with a strictly smaller sequencer.
///
/// Zero affected rows means the stored row was not older.
const CONDITIONAL_UPSERT: &str = r#"
    INSERT INTO metadata_records (
        identity_key, container, object_key, version_id, sequencer,
        last_event_time, etag, deleted, metadata, expire_at, updated_at
    ) VALUES (
        $1, $2, $3, $4, $5,
        $6, $7, $8, $9, $10, NOW()
    )
    ON CONFLICT (identity_key) DO UPDATE SET
        container = EXCLUDED.container,
        object_key = EXCLUDED.object_key,
        version_id = EXCLUDED.version_id,
        sequencer = EXCLUDED.sequencer,
        last_event_time = EXCLUDED.last_event_time,
        etag = EXCLUDED.etag,
        deleted = EXCLUDED.deleted,
        metadata = EXCLUDED.metadata,
        expire_at = EXCLUDED.expire_at,
        updated_at = NOW()
    WHERE metadata_records.sequencer < EXCLUDED.sequencer
"#;

/// Stored metadata row
#[derive(Debug, Clone, FromRow)]
struct RecordRow {
    identity_key: String,
    container: String,
    object_key: String,
    version_id: Option<String>,
    sequencer: String,
    last_event_time: DateTime<Utc>,
    etag: Option<String>,
    deleted: bool,
    metadata: Option<serde_json::Value>,
    expire_at: DateTime<Utc>,
}

impl From<RecordRow> for MetadataRecord {
    fn from(row: RecordRow) -> Self {
        Self {
            identity_key: IdentityKey::from_raw(row.identity_key),
            container: row.container,
            key: row.object_key,
            version_id: row.version_id,
            sequencer: Sequencer::new(row.sequencer),
            last_event_time: row.last_event_time,
            etag: row.etag,
            deleted: row.deleted,
            metadata: row.metadata,
            expire_at: row.expire_at,
        }
    }
}

/// PostgreSQL-backed record store
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new store with connection pool
    pub async fn new(config: &PostgresConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PostgresStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self), fields(identity_key = %key))]
    async fn get_record(&self, key: &IdentityKey) -> Result<Option<MetadataRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT identity_key, container, object_key, version_id, sequencer,
                   last_event_time, etag, deleted, metadata, expire_at
            FROM metadata_records
            WHERE identity_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::transport("postgres", e))?;

        Ok(row.map(MetadataRecord::from))
    }

    #[instrument(skip(self, record), fields(identity_key = %record.identity_key, sequencer = %record.sequencer))]
    async fn conditional_put(&self, record: &MetadataRecord) -> Result<CommitResult> {
        let metadata = record.metadata.clone().map(document::strip_nul);

        let result = sqlx::query(CONDITIONAL_UPSERT)
            .bind(record.identity_key.as_str())
            .bind(&record.container)
            .bind(&record.key)
            .bind(&record.version_id)
            .bind(record.sequencer.as_str())
            .bind(record.last_event_time)
            .bind(&record.etag)
            .bind(record.deleted)
            .bind(metadata)
            .bind(record.expire_at)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::transport("postgres", e))?;

        let outcome = commit_result(result.rows_affected());
        debug!(?outcome, "Conditional upsert finished");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM metadata_records WHERE expire_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::transport("postgres", e))?;

        let count = result.rows_affected();
        if count > 0 {
            info!(deleted_count = count, "Purged expired metadata records");
        }

        Ok(count)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::transport("postgres", e))?;
        Ok(())
    }
}

fn commit_result(rows_affected: u64) -> CommitResult {
    if rows_affected == 0 {
        CommitResult::Rejected
    } else {
        CommitResult::Committed
    }
}
