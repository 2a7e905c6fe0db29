//! JPEG output helpers shared by all plugins.
//!
//! Decoding and re-encoding are CPU-bound and run under `spawn_blocking`
//! so scheduler workers stay responsive.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

use crate::error::{CoreError, Result};

const JPEG_QUALITY: u8 = 85;

/// In-memory bytes or an on-disk source for the encoder.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

/// Apply the EXIF Orientation tag (1..=8) so the output displays
/// upright.
pub fn apply_orientation(image: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate90().flipv(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Decode `source`, orient, shrink to fit `max_edge`, and write a JPEG
/// at `output`.
pub async fn write_thumbnail_jpeg(
    source: ImageSource,
    orientation: u16,
    max_edge: u32,
    output: PathBuf,
) -> Result<()> {
    encode_jpeg(source, orientation, Some(max_edge), output).await
}

/// Decode `source`, orient, and write a full-resolution JPEG at
/// `output`.
pub async fn write_view_jpeg(
    source: ImageSource,
    orientation: u16,
    output: PathBuf,
) -> Result<()> {
    encode_jpeg(source, orientation, None, output).await
}

async fn encode_jpeg(
    source: ImageSource,
    orientation: u16,
    max_edge: Option<u32>,
    output: PathBuf,
) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let image = match source {
            ImageSource::Bytes(bytes) => image::load_from_memory(&bytes)?,
            ImageSource::Path(path) => image::open(&path)?,
        };
        let mut image = apply_orientation(image, orientation);
        if let Some(edge) = max_edge
            && (image.width() > edge || image.height() > edge)
        {
            image = image.resize(edge, edge, FilterType::Lanczos3);
        }
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(&output)?;
        let mut writer = std::io::BufWriter::new(file);
        let encoder = JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
        // JPEG has no alpha channel.
        image.to_rgb8().write_with_encoder(encoder)?;
        Ok(())
    })
    .await
    .map_err(|err| CoreError::Internal(format!("encode task failed: {err}")))?
}

/// Probe the dimensions of an image file without a full decode.
pub fn image_dimensions(path: &Path) -> Option<(u32, u32)> {
    image::image_dimensions(path).ok()
}
