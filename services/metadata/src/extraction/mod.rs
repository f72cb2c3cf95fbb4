//! Metadata extraction.
//!
//! An [`Extractor`] decides whether it applies to an event and, if so,
//! produces a [`Fragment`] for it. The [`CompositeExtractor`] runs every
//! applicable member and merges their fragments in registration order.

pub mod image;
pub mod labels;
pub mod object_size;

use crate::config::{ExtractionConfig, ExtractorKind};
use crate::document::{self, Fragment};
use crate::error::Result;
use crate::event::ChangeEvent;
use crate::label_detector::LabelDetector;
use crate::object_source::ObjectSource;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub use self::image::ImageExtractor;
pub use labels::LabelExtractor;
pub use object_size::ObjectSizeExtractor;

/// Metadata extraction capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Pure applicability check; must not perform IO
    fn applies_to(&self, event: &ChangeEvent) -> bool;

    /// Produce the fragment for `event`.
    ///
    /// Fails with `ObjectUnavailable` when the notified object or version is
    /// gone or no longer matches the event's etag.
    async fn extract(&self, event: &ChangeEvent) -> Result<Fragment>;
}

/// Runs all applicable extractors and merges their output.
///
/// Members run concurrently but are merged in registration order, so on a
/// section collision the later-registered extractor wins regardless of which
/// call finished first. A member reporting `ObjectUnavailable` contributes
/// nothing; any other member failure fails the whole extraction.
pub struct CompositeExtractor {
    extractors: Vec<Box<dyn Extractor>>,
}

impl CompositeExtractor {
    pub fn new(extractors: Vec<Box<dyn Extractor>>) -> Self {
        Self { extractors }
    }

    /// Build the configured extractors in configured order
    pub fn from_config(
        config: &ExtractionConfig,
        objects: Arc<dyn ObjectSource>,
        labels: Arc<dyn LabelDetector>,
    ) -> Self {
        let extractors = config
            .extractors
            .iter()
            .map(|kind| -> Box<dyn Extractor> {
                match kind {
                    ExtractorKind::Labels => Box::new(LabelExtractor::new(
                        labels.clone(),
                        config.max_labels,
                        config.image_extensions.clone(),
                    )),
                    ExtractorKind::Image => Box::new(ImageExtractor::new(
                        objects.clone(),
                        config.image_extensions.clone(),
                    )),
                    ExtractorKind::ObjectSize => {
                        Box::new(ObjectSizeExtractor::new(objects.clone()))
                    }
                }
            })
            .collect::<Vec<_>>();

        info!(
            extractors = ?extractors.iter().map(|e| e.name()).collect::<Vec<_>>(),
            "Extraction pipeline configured"
        );

        Self::new(extractors)
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

#[async_trait]
impl Extractor for CompositeExtractor {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn applies_to(&self, event: &ChangeEvent) -> bool {
        self.extractors.iter().any(|e| e.applies_to(event))
    }

    #[instrument(skip(self, event), fields(key = %event.key, sequencer = %event.sequencer))]
    async fn extract(&self, event: &ChangeEvent) -> Result<Fragment> {
        let applicable: Vec<&dyn Extractor> = self
            .extractors
            .iter()
            .map(|e| e.as_ref())
            .filter(|e| e.applies_to(event))
            .collect();

        // join_all yields results in input order, not completion order
        let results = join_all(
            applicable
                .iter()
                .map(|extractor| async move { (extractor.name(), extractor.extract(event).await) }),
        )
        .await;

        let mut merged = Fragment::new();
        for (name, result) in results {
            match result {
                Ok(fragment) => {
                    debug!(extractor = name, sections = fragment.len(), "Extractor finished");
                    document::merge(&mut merged, fragment);
                }
                Err(err) if err.is_object_unavailable() => {
                    info!(extractor = name, error = %err, "Object unavailable, contributing nothing");
                    metrics::counter!("metadata.extractors.unavailable").increment(1);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(merged)
    }
}

/// Case-insensitive extension check shared by the image-oriented extractors
pub(crate) fn has_extension(event: &ChangeEvent, extensions: &[String]) -> bool {
    event
        .key_extension()
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
        .unwrap_or(false)
}
