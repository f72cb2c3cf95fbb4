use anyhow::{Context, Result};
use metadata_service::api::{start_api_server, AppState};
use metadata_service::config::{Config, StoreBackend};
use metadata_service::{
    CompositeExtractor, DynamoDbStore, Handler, IdempotentStore, MemoryStore, PostgresStore,
    RecordStore, RekognitionDetector, S3ObjectSource,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        backend = ?config.store.backend,
        "Starting metadata service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let records = build_record_store(&config).await?;
    let store = IdempotentStore::new(records, config.store_timeout());

    let objects = Arc::new(
        S3ObjectSource::new(&config.s3)
            .await
            .context("Failed to initialize S3 object source")?,
    );
    let labels = Arc::new(
        RekognitionDetector::new(&config.rekognition)
            .await
            .context("Failed to initialize label detector")?,
    );

    let extractor = CompositeExtractor::from_config(&config.extraction, objects, labels);
    if extractor.is_empty() {
        warn!("No extractors configured, created objects will get empty metadata");
    }

    let handler = Arc::new(Handler::new(
        Arc::new(extractor),
        store.clone(),
        config.retention(),
        config.extraction_timeout(),
    ));

    // Spawn retention purge task
    let purge_handle = spawn_purge_task(&config, store);

    // Spawn API server task
    let api_state = AppState::new(handler);
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Metadata service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down metadata service");

    // Abort tasks
    api_handle.abort();
    if let Some(handle) = purge_handle {
        handle.abort();
    }

    info!("Metadata service stopped");

    Ok(())
}

/// Construct the configured record store backend
async fn build_record_store(config: &Config) -> Result<Arc<dyn RecordStore>> {
    let store: Arc<dyn RecordStore> = match config.store.backend {
        StoreBackend::Postgres => {
            let postgres_config = config
                .store
                .postgres
                .as_ref()
                .context("Missing [store.postgres] section")?;

            let store = PostgresStore::new(postgres_config)
                .await
                .context("Failed to initialize PostgreSQL record store")?;

            // Run migrations if enabled
            if postgres_config.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Arc::new(store)
        }
        StoreBackend::Dynamodb => {
            let dynamodb_config = config
                .store
                .dynamodb
                .as_ref()
                .context("Missing [store.dynamodb] section")?;

            Arc::new(
                DynamoDbStore::new(dynamodb_config)
                    .await
                    .context("Failed to initialize DynamoDB record store")?,
            )
        }
        StoreBackend::Memory => {
            warn!("Using in-memory record store, records do not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    Ok(store)
}

/// Periodically delete records past their retention horizon.
///
/// DynamoDB expires items through its native TTL, so no task runs for it.
fn spawn_purge_task(
    config: &Config,
    store: IdempotentStore,
) -> Option<tokio::task::JoinHandle<()>> {
    if config.store.backend == StoreBackend::Dynamodb {
        return None;
    }

    let period = config.purge_interval();
    info!(interval_secs = period.as_secs(), "Starting retention purge task");

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match store.purge_expired().await {
                Ok(count) => {
                    metrics::counter!("metadata.records.purged").increment(count);
                }
                Err(e) => error!(error = %e, "Retention purge failed"),
            }
        }
    }))
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
