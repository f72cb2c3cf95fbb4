use super::{has_extension, Extractor};
use crate::document::Fragment;
use crate::error::Result;
use crate::event::ChangeEvent;
use crate::object_source::{FetchRequest, ObjectSource};
use ::image::{ImageDecoder, ImageReader};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{instrument, warn};

/// Image header extractor.
///
/// Produces an `image` section with dimensions and container format, and an
/// `exif` section carrying the raw EXIF block when the format embeds one.
pub struct ImageExtractor {
    objects: Arc<dyn ObjectSource>,
    extensions: Vec<String>,
}

impl ImageExtractor {
    pub fn new(objects: Arc<dyn ObjectSource>, extensions: Vec<String>) -> Self {
        Self {
            objects,
            extensions,
        }
    }
}

#[async_trait]
impl Extractor for ImageExtractor {
    fn name(&self) -> &'static str {
        "image"
    }

    fn applies_to(&self, event: &ChangeEvent) -> bool {
        has_extension(event, &self.extensions)
    }

    #[instrument(skip(self, event), fields(key = %event.key))]
    async fn extract(&self, event: &ChangeEvent) -> Result<Fragment> {
        let bytes = self.objects.fetch(&FetchRequest::pinned(event)).await?;

        match describe_image(&bytes) {
            Some(fragment) => Ok(fragment),
            None => {
                warn!(size_bytes = bytes.len(), "Object is not a decodable image");
                Ok(Fragment::new())
            }
        }
    }
}

/// Read dimensions, format and EXIF from the image header
fn describe_image(bytes: &[u8]) -> Option<Fragment> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    let format = reader.format()?;
    let mut decoder = reader.into_decoder().ok()?;
    let (width, height) = decoder.dimensions();
    let exif = decoder.exif_metadata().ok().flatten();

    let mut fragment = Fragment::new();
    fragment.insert(
        "image".to_string(),
        json!({
            "image_width": width,
            "image_height": height,
            "format": format!("{:?}", format).to_uppercase(),
        }),
    );

    if let Some(exif) = exif {
        fragment.insert(
            "exif".to_string(),
            json!({
                "byte_length": exif.len(),
                "raw_base64": STANDARD.encode(&exif),
            }),
        );
    }

    Some(fragment)
}
