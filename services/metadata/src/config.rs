use aws_config::BehaviorVersion;
use aws_types::region::Region;
use aws_types::SdkConfig;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the metadata service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Rekognition configuration
    #[serde(default)]
    pub rekognition: RekognitionConfig,
    /// Record store configuration
    pub store: StoreConfig,
    /// Extraction pipeline configuration
    #[serde(default)]
    pub extraction: ExtractionConfig,
    /// Timeouts applied to collaborator calls
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// API configuration for the invocation endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// S3 client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Rekognition client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RekognitionConfig {
    #[serde(default = "default_region")]
    pub region: String,
    pub endpoint_url: Option<String>,
}

/// Record store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Postgres,
    Dynamodb,
    Memory,
}

/// Record store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Retention horizon of a record after its last update
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// How often expired records are purged; DynamoDB relies on native TTL instead
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
    pub postgres: Option<PostgresConfig>,
    pub dynamodb: Option<DynamoDbConfig>,
}

/// PostgreSQL configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// DynamoDB configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DynamoDbConfig {
    pub table_name: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub endpoint_url: Option<String>,
}

/// Registered extractor variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    Labels,
    Image,
    ObjectSize,
}

/// Extraction pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    /// Extractors in registration order; later entries win on section collision
    #[serde(default = "default_extractors")]
    pub extractors: Vec<ExtractorKind>,
    /// Maximum labels requested from label detection
    #[serde(default = "default_max_labels")]
    pub max_labels: i32,
    /// Key extensions treated as images
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

/// Caller-supplied timeouts
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Upper bound for the whole extraction pipeline
    #[serde(default = "default_extraction_timeout_secs")]
    pub extraction_secs: u64,
    /// Upper bound for each record store call
    #[serde(default = "default_store_timeout_secs")]
    pub store_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "metadata-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_retention_hours() -> u64 {
    24
}

fn default_purge_interval_secs() -> u64 {
    900
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_extractors() -> Vec<ExtractorKind> {
    vec![ExtractorKind::Labels, ExtractorKind::Image]
}

fn default_max_labels() -> i32 {
    3
}

fn default_image_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
}

fn default_extraction_timeout_secs() -> u64 {
    45
}

fn default_store_timeout_secs() -> u64 {
    5
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "metadata-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .set_default("store.backend", "memory")?
            // Add config file if present
            .add_source(config::File::with_name("config/metadata").required(false))
            .add_source(config::File::with_name("/etc/metadata/metadata").required(false))
            // Override with environment variables
            // METADATA__STORE__DYNAMODB__TABLE_NAME -> store.dynamodb.table_name
            .add_source(
                config::Environment::with_prefix("METADATA")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("extraction.extractors")
                    .with_list_parse_key("extraction.image_extensions")
                    .with_list_parse_key("api.cors_origins"),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject backend selections whose section is missing
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.store.backend {
            StoreBackend::Postgres if self.store.postgres.is_none() => {
                anyhow::bail!("store.backend = postgres requires a [store.postgres] section")
            }
            StoreBackend::Dynamodb if self.store.dynamodb.is_none() => {
                anyhow::bail!("store.backend = dynamodb requires a [store.dynamodb] section")
            }
            _ => {}
        }

        if self.extraction.max_labels < 1 {
            anyhow::bail!("extraction.max_labels must be at least 1");
        }

        Ok(())
    }

    /// Get record retention as Duration
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.store.retention_hours * 3600)
    }

    /// Get purge interval as Duration
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.store.purge_interval_secs)
    }

    /// Get extraction timeout as Duration
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.extraction_secs)
    }

    /// Get store call timeout as Duration
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.store_secs)
    }
}

/// Load the shared AWS SDK configuration for `region`
pub async fn load_aws_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for RekognitionConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            extractors: default_extractors(),
            max_labels: default_max_labels(),
            image_extensions: default_image_extensions(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            extraction_secs: default_extraction_timeout_secs(),
            store_secs: default_store_timeout_secs(),
        }
    }
}
