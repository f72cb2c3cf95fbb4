use crate::config::{load_aws_config, S3Config};
use crate::error::{Error, Result};
use crate::event::ChangeEvent;
use async_trait::async_trait;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, instrument};

/// Object fetch pinned to a specific version and content fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub container: String,
    pub key: String,
    pub version_id: Option<String>,
    /// Fetch fails with `ObjectUnavailable` unless the stored etag matches
    pub etag_must_match: Option<String>,
}

impl FetchRequest {
    /// Request exactly the content the event reported
    pub fn pinned(event: &ChangeEvent) -> Self {
        Self {
            container: event.container.clone(),
            key: event.key.clone(),
            version_id: event.version_id.clone(),
            etag_must_match: event.etag.clone(),
        }
    }

    fn unavailable(&self) -> Error {
        Error::ObjectUnavailable {
            container: self.container.clone(),
            key: self.key.clone(),
        }
    }
}

/// Read access to object bytes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Fetch object bytes, or `ObjectUnavailable` if the object was removed or superseded
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<u8>>;
}

/// S3-backed object source
pub struct S3ObjectSource {
    client: S3Client,
}

impl S3ObjectSource {
    /// Create a new S3 object source
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = load_aws_config(&config.region).await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(region = %config.region, "S3 object source initialized");

        Ok(Self { client })
    }
}

#[async_trait]
impl ObjectSource for S3ObjectSource {
    #[instrument(skip(self), fields(container = %request.container, key = %request.key))]
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&request.container)
            .key(&request.key)
            .set_version_id(request.version_id.clone())
            .set_if_match(request.etag_must_match.clone())
            .send()
            .await;

        let output = match response {
            Ok(output) => output,
            Err(err) => {
                let status = err.raw_response().map(|r| r.status().as_u16());
                let code = err.as_service_error().and_then(|e| e.code());
                if is_unavailable(code, status) {
                    info!(
                        code = code.unwrap_or("unknown"),
                        "Object no longer matches the notification"
                    );
                    return Err(request.unavailable());
                }
                return Err(Error::transport("s3", DisplayErrorContext(&err)));
            }
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| Error::transport("s3", e))?
            .into_bytes();

        debug!(size_bytes = bytes.len(), "Fetched object");

        Ok(bytes.to_vec())
    }
}

/// Missing bucket/key/version or a failed etag precondition
fn is_unavailable(code: Option<&str>, status: Option<u16>) -> bool {
    matches!(
        code,
        Some("NoSuchKey" | "NoSuchBucket" | "NoSuchVersion" | "PreconditionFailed")
    ) || status == Some(412)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{test_event, EventKind};

    #[test]
    fn test_pinned_request_carries_version_and_etag() {
        let mut event = test_event(EventKind::Created, "photos/a.jpg", "01");
        event.version_id = Some("v1".to_string());

        let request = FetchRequest::pinned(&event);
        assert_eq!(request.container, "input-bucket");
        assert_eq!(request.key, "photos/a.jpg");
        assert_eq!(request.version_id.as_deref(), Some("v1"));
        assert_eq!(request.etag_must_match, event.etag);
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(is_unavailable(Some("NoSuchKey"), Some(404)));
        assert!(is_unavailable(Some("NoSuchBucket"), Some(404)));
        assert!(is_unavailable(Some("PreconditionFailed"), Some(412)));
        assert!(is_unavailable(None, Some(412)));
        assert!(!is_unavailable(Some("AccessDenied"), Some(403)));
        assert!(!is_unavailable(Some("SlowDown"), Some(503)));
        assert!(!is_unavailable(None, None));
    }

    #[test]
    fn test_unavailable_error_names_object() {
        let request = FetchRequest::pinned(&test_event(EventKind::Created, "a.png", "01"));
        let err = request.unavailable();
        assert!(err.is_object_unavailable());
        assert_eq!(err.to_string(), "Object unavailable: input-bucket/a.png");
    }
}
