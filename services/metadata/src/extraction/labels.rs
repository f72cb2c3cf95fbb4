use super::{has_extension, Extractor};
use crate::document::Fragment;
use crate::error::{Error, Result};
use crate::event::ChangeEvent;
use crate::label_detector::{DetectRequest, LabelDetector};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::instrument;

/// Label detection extractor, producing a `labels` section
pub struct LabelExtractor {
    detector: Arc<dyn LabelDetector>,
    max_labels: i32,
    extensions: Vec<String>,
}

impl LabelExtractor {
    pub fn new(detector: Arc<dyn LabelDetector>, max_labels: i32, extensions: Vec<String>) -> Self {
        Self {
            detector,
            max_labels,
            extensions,
        }
    }
}

#[async_trait]
impl Extractor for LabelExtractor {
    fn name(&self) -> &'static str {
        "labels"
    }

    fn applies_to(&self, event: &ChangeEvent) -> bool {
        has_extension(event, &self.extensions)
    }

    #[instrument(skip(self, event), fields(key = %event.key))]
    async fn extract(&self, event: &ChangeEvent) -> Result<Fragment> {
        let request = DetectRequest {
            container: event.container.clone(),
            key: event.key.clone(),
            version_id: event.version_id.clone(),
            max_labels: self.max_labels,
        };

        let labels = self.detector.detect_labels(&request).await?;

        let mut fragment = Fragment::new();
        fragment.insert(
            "labels".to_string(),
            serde_json::to_value(labels).map_err(|e| Error::Decode(e.to_string()))?,
        );
        Ok(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{test_event, EventKind};
    use crate::label_detector::{Label, MockLabelDetector};
    use serde_json::json;

    fn label(name: &str) -> Label {
        Label {
            name: name.to_string(),
            confidence: Some(90.0),
            parents: vec![],
            aliases: vec![],
            categories: vec![],
        }
    }

    #[tokio::test]
    async fn test_label_generation() {
        let mut detector = MockLabelDetector::new();
        detector
            .expect_detect_labels()
            .withf(|request| {
                request.container == "input-bucket"
                    && request.key == "bar.jpg"
                    && request.version_id.is_none()
                    && request.max_labels == 3
            })
            .times(1)
            .returning(|_| Ok(vec![label("a"), label("b"), label("c")]));

        let extractor = LabelExtractor::new(Arc::new(detector), 3, vec!["jpg".to_string()]);
        let event = test_event(EventKind::Created, "bar.jpg", "123");

        let fragment = extractor.extract(&event).await.unwrap();
        let names: Vec<_> = fragment["labels"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["name"].clone())
            .collect();
        assert_eq!(names, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_version_is_forwarded() {
        let mut detector = MockLabelDetector::new();
        detector
            .expect_detect_labels()
            .withf(|request| request.version_id.as_deref() == Some("v7"))
            .times(1)
            .returning(|_| Ok(vec![]));

        let extractor = LabelExtractor::new(Arc::new(detector), 3, vec!["jpg".to_string()]);
        let mut event = test_event(EventKind::Created, "bar.jpg", "123");
        event.version_id = Some("v7".to_string());

        let fragment = extractor.extract(&event).await.unwrap();
        assert_eq!(fragment["labels"], json!([]));
    }

    #[test]
    fn test_applies_to() {
        let extractor = LabelExtractor::new(
            Arc::new(MockLabelDetector::new()),
            3,
            vec!["jpg".to_string(), "png".to_string()],
        );

        assert!(extractor.applies_to(&test_event(EventKind::Created, "x/y.PNG", "1")));
        assert!(!extractor.applies_to(&test_event(EventKind::Created, "x/y.pdf", "1")));
    }
}
