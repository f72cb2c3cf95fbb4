use super::Extractor;
use crate::document::Fragment;
use crate::error::Result;
use crate::event::ChangeEvent;
use crate::object_source::{FetchRequest, ObjectSource};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Records the fetched object's size under `sample_metadata`; applies to every object
pub struct ObjectSizeExtractor {
    objects: Arc<dyn ObjectSource>,
}

impl ObjectSizeExtractor {
    pub fn new(objects: Arc<dyn ObjectSource>) -> Self {
        Self { objects }
    }
}

#[async_trait]
impl Extractor for ObjectSizeExtractor {
    fn name(&self) -> &'static str {
        "object_size"
    }

    fn applies_to(&self, _event: &ChangeEvent) -> bool {
        true
    }

    async fn extract(&self, event: &ChangeEvent) -> Result<Fragment> {
        let bytes = self.objects.fetch(&FetchRequest::pinned(event)).await?;

        let mut fragment = Fragment::new();
        fragment.insert(
            "sample_metadata".to_string(),
            json!({ "object_size": bytes.len() }),
        );
        Ok(fragment)
    }
}
