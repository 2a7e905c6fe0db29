//! Canon CR3 (ISOBMFF RAW) support.
//!
//! CR3 embeds its small thumbnail JPEG inside a Canon-proprietary `uuid`
//! box nested in `moov` — not in the EXIF IFD1 — so standard TIFF/IFD
//! parsing never finds it. The box lives near the start of the file,
//! well inside the prefetch buffer, which makes thumbnail extraction a
//! zero-extra-I/O operation on network storage. Full-resolution previews
//! come from the embedded `JpgFromRaw` via exiftool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::error::Result;

use super::encode::{ImageSource, write_thumbnail_jpeg, write_view_jpeg};
use super::exif::scan_orientation;
use super::exiftool::ExifTool;
use super::{CacheLayout, FullMetadata, ImagePlugin};

/// GUID of the Canon metadata uuid box that carries the thumbnail.
const CANON_UUID: [u8; 16] = [
    0x85, 0xc0, 0xb6, 0x87, 0x82, 0x0f, 0x11, 0xe0, 0x81, 0x11, 0xf4, 0xce, 0x46, 0x2b, 0x6a,
    0x48,
];

/// Extract the thumbnail JPEG from the Canon uuid box of an already-read
/// CR3 buffer. Returns `None` when the buffer does not cover the
/// thumbnail (caller falls back to exiftool).
pub fn extract_cr3_thumbnail(buffer: &[u8]) -> Option<&[u8]> {
    let n = buffer.len();
    let mut pos = 0usize;
    // Walk top-level ISOBMFF boxes (big-endian size:u32, type:4B).
    while pos + 8 <= n {
        let box_size = u32::from_be_bytes(buffer[pos..pos + 4].try_into().ok()?) as usize;
        let box_type = &buffer[pos + 4..pos + 8];
        if box_size < 8 {
            return None;
        }
        if box_type == b"moov" {
            let moov_end = (pos + box_size).min(n);
            let mut inner = pos + 8;
            while inner + 24 <= moov_end {
                let inner_size =
                    u32::from_be_bytes(buffer[inner..inner + 4].try_into().ok()?) as usize;
                let inner_type = &buffer[inner + 4..inner + 8];
                if inner_size < 8 {
                    return None;
                }
                if inner_type == b"uuid" && buffer[inner + 8..inner + 24] == CANON_UUID {
                    let content_start = inner + 24;
                    let content_end = (inner + inner_size).min(n);
                    return jpeg_in_range(buffer, content_start, content_end);
                }
                inner += inner_size;
            }
            return None;
        }
        pos += box_size;
    }
    None
}

/// First JPEG inside `[start, end)` whose SOI is followed by a standard
/// header marker: DQT (0xDB) or APPn (0xE0..=0xEF). Canon-private data
/// in the same box also starts with `FF D8 FF` but continues with an SOF
/// marker (typically 0xC1); those starts are skipped.
fn jpeg_in_range(buffer: &[u8], start: usize, end: usize) -> Option<&[u8]> {
    let end = end.min(buffer.len());
    let mut search = start;
    let soi = loop {
        if search + 4 > end {
            return None;
        }
        let found = super::exif::find(&buffer[search..end], b"\xff\xd8\xff")? + search;
        if found + 3 >= end {
            return None;
        }
        let fourth = buffer[found + 3];
        if fourth == 0xDB || (0xE0..=0xEF).contains(&fourth) {
            break found;
        }
        search = found + 3;
    };
    let eoi = super::exif::find(&buffer[soi + 2..end], b"\xff\xd9")? + soi + 2;
    Some(&buffer[soi..eoi + 2])
}

/// Plugin for Canon CR3 RAW files.
pub struct Cr3Plugin {
    layout: CacheLayout,
    exiftool: Arc<ExifTool>,
}

impl Cr3Plugin {
    pub fn new(layout: CacheLayout, exiftool: Arc<ExifTool>) -> Self {
        Self { layout, exiftool }
    }

    async fn orientation_of(&self, path: &Path, prefetch: Option<&[u8]>) -> u16 {
        match prefetch {
            Some(buffer) => scan_orientation(buffer),
            None => match read_head(path).await {
                Ok(head) => scan_orientation(&head),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "could not read CR3 header for orientation");
                    1
                }
            },
        }
    }

    /// Embedded preview JPEG via exiftool: `JpgFromRaw` first (highest
    /// quality), `PreviewImage` as fallback.
    async fn extract_preview_jpeg(&self, path: &Path) -> Option<Vec<u8>> {
        let path_text = path.to_string_lossy();
        match self
            .exiftool
            .execute_binary(&["-JpgFromRaw", "-b", &path_text])
            .await
        {
            Ok(data) if !data.is_empty() => return Some(data),
            Ok(_) => debug!(path = %path_text, "JpgFromRaw empty; trying PreviewImage"),
            Err(err) => warn!(path = %path_text, error = %err, "JpgFromRaw extraction failed"),
        }
        match self
            .exiftool
            .execute_binary(&["-PreviewImage", "-b", &path_text])
            .await
        {
            Ok(data) if !data.is_empty() => Some(data),
            Ok(_) => {
                warn!(path = %path_text, "PreviewImage also empty");
                None
            }
            Err(err) => {
                warn!(path = %path_text, error = %err, "PreviewImage extraction failed");
                None
            }
        }
    }

    async fn extract_thumbnail_jpeg(&self, path: &Path) -> Option<Vec<u8>> {
        let path_text = path.to_string_lossy();
        match self
            .exiftool
            .execute_binary(&["-ThumbnailImage", "-b", &path_text])
            .await
        {
            Ok(data) if !data.is_empty() => Some(data),
            Ok(_) => {
                warn!(path = %path_text, "exiftool returned no ThumbnailImage data");
                None
            }
            Err(err) => {
                warn!(path = %path_text, error = %err, "ThumbnailImage extraction failed");
                None
            }
        }
    }
}

#[async_trait]
impl ImagePlugin for Cr3Plugin {
    fn name(&self) -> &'static str {
        "Cr3Plugin"
    }

    fn is_available(&self) -> bool {
        ExifTool::is_available()
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        &[".cr3"]
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

        let orientation = self.orientation_of(path, prefetch).await;
        let embedded = match prefetch.and_then(extract_cr3_thumbnail) {
            Some(jpeg) => Some(jpeg.to_vec()),
            None => {
                // Prefetch buffer did not cover the thumbnail; this is the
                // slow path and worth noticing on network storage.
                debug!(path = %path.display(), "CR3 thumbnail not in prefetch buffer; using exiftool");
                self.extract_thumbnail_jpeg(path).await
            }
        };

        if let Some(bytes) = embedded
            && write_thumbnail_jpeg(
                ImageSource::Bytes(bytes),
                orientation,
                self.layout.thumbnail_size,
                output.clone(),
            )
            .await
            .is_ok()
        {
            return Ok(Some(output));
        }

        // Last resort: build the thumbnail from the full preview image.
        debug!(path = %path.display(), "building CR3 thumbnail from its preview image");
        let Some(view_path) = self.process_view_image(path, content_hash).await? else {
            error!(path = %path.display(), "no source available for CR3 thumbnail");
            return Ok(None);
        };
        write_thumbnail_jpeg(
            ImageSource::Path(view_path),
            // The view image is already orientation-corrected.
            1,
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
        let orientation = self.orientation_of(path, None).await;
        let Some(bytes) = self.extract_preview_jpeg(path).await else {
            error!(path = %path.display(), "failed to extract preview JPEG from CR3");
            return Ok(None);
        };
        write_view_jpeg(ImageSource::Bytes(bytes), orientation, output.clone()).await?;
        Ok(Some(output))
    }

    async fn extract_full_metadata(&self, path: &Path) -> Result<Option<FullMetadata>> {
        let path_text = path.to_string_lossy();
        let raw = self
            .exiftool
            .execute_binary(&["-json", "-n", &path_text])
            .await?;
        let parsed: Vec<serde_json::Value> = serde_json::from_slice(&raw)?;
        let Some(data) = parsed.into_iter().next() else {
            return Ok(None);
        };
        Ok(Some(full_metadata_from_exiftool(data)))
    }
}

/// Map exiftool's JSON output (numeric mode) onto the store columns.
fn full_metadata_from_exiftool(data: serde_json::Value) -> FullMetadata {
    let text = |key: &str| data.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let number = |key: &str| data.get(key).and_then(|v| v.as_f64());

    let mut meta = FullMetadata {
        width: number("ImageWidth").map(|v| v as i64),
        height: number("ImageHeight").map(|v| v as i64),
        rating: number("Rating").map(|v| v as i64).filter(|r| (0..=5).contains(r)),
        camera_make: text("Make"),
        camera_model: text("Model"),
        lens_model: text("LensModel"),
        focal_length: number("FocalLength"),
        aperture: number("FNumber"),
        shutter_speed: data
            .get("ShutterSpeed")
            .map(|v| v.to_string().trim_matches('"').to_string()),
        iso: number("ISO").map(|v| v as i64),
        date_taken: text("DateTimeOriginal")
            .or_else(|| text("CreateDate"))
            .or_else(|| text("DateTime")),
        orientation: number("Orientation").map(|v| v as i64),
        color_space: data
            .get("ColorSpace")
            .map(|v| v.to_string().trim_matches('"').to_string()),
        exif_data: serde_json::Value::Object(serde_json::Map::new()),
    };
    if let serde_json::Value::Object(map) = data {
        meta.exif_data = serde_json::Value::Object(map);
    }
    meta
}

async fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; crate::util::CONTENT_HASH_BYTES];
    let mut filled = 0;
    loop {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == buf.len() {
            break;
        }
    }
    buf.truncate(filled);
    Ok(buf)
}
