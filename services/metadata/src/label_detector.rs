use crate::config::{load_aws_config, RekognitionConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_sdk_rekognition::config::Builder as RekognitionConfigBuilder;
use aws_sdk_rekognition::error::DisplayErrorContext;
use aws_sdk_rekognition::types::{Image, S3Object};
use aws_sdk_rekognition::Client as RekognitionClient;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// Object to run label detection against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectRequest {
    pub container: String,
    pub key: String,
    pub version_id: Option<String>,
    pub max_labels: i32,
}

/// A detected label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub confidence: Option<f32>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

/// Label detection service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LabelDetector: Send + Sync {
    /// Detect labels, or `ObjectUnavailable` if the service cannot read the object
    async fn detect_labels(&self, request: &DetectRequest) -> Result<Vec<Label>>;
}

/// Rekognition-backed label detection
pub struct RekognitionDetector {
    client: RekognitionClient,
}

impl RekognitionDetector {
    pub async fn new(config: &RekognitionConfig) -> anyhow::Result<Self> {
        let aws_config = load_aws_config(&config.region).await;

        let mut builder = RekognitionConfigBuilder::from(&aws_config);
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        info!(region = %config.region, "Rekognition label detector initialized");

        Ok(Self {
            client: RekognitionClient::from_conf(builder.build()),
        })
    }
}

#[async_trait]
impl LabelDetector for RekognitionDetector {
    #[instrument(skip(self), fields(container = %request.container, key = %request.key))]
    async fn detect_labels(&self, request: &DetectRequest) -> Result<Vec<Label>> {
        let s3_object = S3Object::builder()
            .bucket(&request.container)
            .name(&request.key)
            .set_version(request.version_id.clone())
            .build();

        let response = self
            .client
            .detect_labels()
            .image(Image::builder().s3_object(s3_object).build())
            .max_labels(request.max_labels)
            .send()
            .await;

        let output = match response {
            Ok(output) => output,
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_invalid_s3_object_exception())
                    .unwrap_or(false)
                {
                    return Err(Error::ObjectUnavailable {
                        container: request.container.clone(),
                        key: request.key.clone(),
                    });
                }
                return Err(Error::transport("rekognition", DisplayErrorContext(&err)));
            }
        };

        let labels: Vec<Label> = output
            .labels()
            .iter()
            .filter_map(|label| {
                Some(Label {
                    name: label.name()?.to_string(),
                    confidence: label.confidence(),
                    parents: label
                        .parents()
                        .iter()
                        .filter_map(|p| p.name().map(String::from))
                        .collect(),
                    aliases: label
                        .aliases()
                        .iter()
                        .filter_map(|a| a.name().map(String::from))
                        .collect(),
                    categories: label
                        .categories()
                        .iter()
                        .filter_map(|c| c.name().map(String::from))
                        .collect(),
                })
            })
            .collect();

        debug!(label_count = labels.len(), "Labels detected");

        Ok(labels)
    }
}
