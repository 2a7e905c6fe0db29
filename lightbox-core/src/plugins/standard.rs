//! Plugin for formats the `image` crate decodes natively.

use std::io::BufReader;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::Result;

use super::encode::{ImageSource, image_dimensions, write_thumbnail_jpeg, write_view_jpeg};
use super::exif::scan_orientation;
use super::{CacheLayout, FullMetadata, ImagePlugin};

/// JPEG/PNG/TIFF/WebP/BMP/GIF handler. Thumbnails come from a full
/// decode; there is no embedded-preview shortcut for these formats.
pub struct StandardImagePlugin {
    layout: CacheLayout,
}

impl StandardImagePlugin {
    pub fn new(layout: CacheLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl ImagePlugin for StandardImagePlugin {
    fn name(&self) -> &'static str {
        "StandardImagePlugin"
    }

    fn is_available(&self) -> bool {
        // Pure-Rust decoding; no external tools involved.
        true
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".tif", ".tiff", ".webp"]
    }

    fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    async fn process_thumbnail(
        &self,
        path: &Path,
        content_hash: &str,
        prefetch: Option<&[u8]>,
    ) -> Result<Option<PathBuf>> {
        let output = self.layout.thumbnail_path(content_hash);
        if tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Ok(Some(output));
        }
        // Orientation from the prefetched header; the pixel data itself
        // still needs the full file.
        let orientation = prefetch.map(scan_orientation).unwrap_or(1);
        write_thumbnail_jpeg(
            ImageSource::Path(path.to_path_buf()),
            orientation,
            self.layout.thumbnail_size,
            output.clone(),
        )
        .await?;
        Ok(Some(output))
    }

    async fn process_view_image(
        &self,
        path: &Path,
        content_hash: &str,
    ) -> Result<Option<PathBuf>> {
        let output = self.layout.view_image_path(content_hash);
        if tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Ok(Some(output));
        }
        let head = super::read_prefetch(path).await.unwrap_or_default();
        let orientation = scan_orientation(&head);
        write_view_jpeg(
            ImageSource::Path(path.to_path_buf()),
            orientation,
            output.clone(),
        )
        .await?;
        Ok(Some(output))
    }

    async fn extract_full_metadata(&self, path: &Path) -> Result<Option<FullMetadata>> {
        let path = path.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || full_metadata_blocking(&path))
            .await
            .map_err(|err| crate::error::CoreError::Internal(format!(
                "metadata extraction task failed: {err}"
            )))?;
        Ok(extracted)
    }
}

/// Parse the EXIF container with `kamadak-exif` and map the capture
/// fields onto the store's columns. Dimensions fall back to the image
/// header when the EXIF block lacks them.
fn full_metadata_blocking(path: &Path) -> Option<FullMetadata> {
    let mut meta = FullMetadata::default();

    if let Some((width, height)) = image_dimensions(path) {
        meta.width = Some(width as i64);
        meta.height = Some(height as i64);
    }

    let file = std::fs::File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(exif) => exif,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "no EXIF container; keeping dimensions only");
            meta.exif_data = json!({});
            return Some(meta);
        }
    };

    let mut raw = serde_json::Map::new();
    for field in exif.fields() {
        raw.insert(
            field.tag.to_string(),
            json!(field.display_value().with_unit(&exif).to_string()),
        );
    }
    meta.exif_data = serde_json::Value::Object(raw);

    let text_of = |tag: exif::Tag| -> Option<String> {
        exif.get_field(tag, exif::In::PRIMARY).map(|f| {
            f.display_value()
                .to_string()
                .trim_matches('"')
                .trim()
                .to_string()
        })
    };
    let number_of = |tag: exif::Tag| -> Option<f64> {
        exif.get_field(tag, exif::In::PRIMARY)
            .and_then(|f| match &f.value {
                exif::Value::Rational(values) => values.first().map(|r| r.to_f64()),
                exif::Value::Short(values) => values.first().map(|v| *v as f64),
                exif::Value::Long(values) => values.first().map(|v| *v as f64),
                _ => None,
            })
    };

    meta.camera_make = text_of(exif::Tag::Make);
    meta.camera_model = text_of(exif::Tag::Model);
    meta.lens_model = text_of(exif::Tag::LensModel);
    meta.focal_length = number_of(exif::Tag::FocalLength);
    meta.aperture = number_of(exif::Tag::FNumber);
    meta.shutter_speed = text_of(exif::Tag::ExposureTime);
    meta.iso = number_of(exif::Tag::PhotographicSensitivity).map(|v| v as i64);
    meta.date_taken = text_of(exif::Tag::DateTimeOriginal)
        .or_else(|| text_of(exif::Tag::DateTime));
    meta.orientation = number_of(exif::Tag::Orientation).map(|v| v as i64);
    meta.color_space = text_of(exif::Tag::ColorSpace);
    if let Some(width) = number_of(exif::Tag::PixelXDimension) {
        meta.width = Some(width as i64);
    }
    if let Some(height) = number_of(exif::Tag::PixelYDimension) {
        meta.height = Some(height as i64);
    }
    Some(meta)
}
