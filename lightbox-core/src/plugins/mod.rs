//! Per-format plugin registry and contract.
//!
//! A plugin owns everything format-specific: thumbnail extraction, view
//! image production, fast and deep metadata extraction, and the sidecar
//! write path. The registry maps file extensions to plugins and is
//! mutable only during startup; a later registration overrides an
//! earlier one for the same extension with a warning.

pub mod cr3;
pub mod encode;
pub mod exif;
pub mod exiftool;
pub mod sidecar;
pub mod standard;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::util::{CONTENT_HASH_BYTES, PREFETCH_BYTES, dotted_extension};

pub use cr3::Cr3Plugin;
pub use exiftool::ExifTool;
pub use standard::StandardImagePlugin;

/// Where cache files live and how large thumbnails are.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    pub thumbnail_dir: PathBuf,
    pub image_dir: PathBuf,
    pub thumbnail_size: u32,
}

impl CacheLayout {
    /// Derive the layout under `cache_root`, creating the directories.
    pub fn create(cache_root: &Path, thumbnail_size: u32) -> Result<Self> {
        let thumbnail_dir = cache_root.join("thumbnails");
        let image_dir = cache_root.join("images");
        std::fs::create_dir_all(&thumbnail_dir)?;
        std::fs::create_dir_all(&image_dir)?;
        Ok(Self {
            thumbnail_dir,
            image_dir,
            thumbnail_size,
        })
    }

    /// `<cache_root>/thumbnails/<content_hash>.jpg`
    pub fn thumbnail_path(&self, content_hash: &str) -> PathBuf {
        self.thumbnail_dir.join(format!("{content_hash}.jpg"))
    }

    /// `<cache_root>/images/<content_hash>.jpg`
    pub fn view_image_path(&self, content_hash: &str) -> PathBuf {
        self.image_dir.join(format!("{content_hash}.jpg"))
    }
}

/// Fast-tier extraction result: what a header scan plus the sidecar can
/// answer without external tools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FastMetadata {
    pub orientation: Option<u16>,
    pub rating: Option<u8>,
}

/// Deep-tier extraction result mapped onto the store's columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FullMetadata {
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub rating: Option<i64>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub lens_model: Option<String>,
    pub focal_length: Option<f64>,
    pub aperture: Option<f64>,
    pub shutter_speed: Option<String>,
    pub iso: Option<i64>,
    pub date_taken: Option<String>,
    pub orientation: Option<i64>,
    pub color_space: Option<String>,
    /// Full key/value set, stored opaquely.
    pub exif_data: serde_json::Value,
}

impl Default for FullMetadata {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            rating: None,
            camera_make: None,
            camera_model: None,
            lens_model: None,
            focal_length: None,
            aperture: None,
            shutter_speed: None,
            iso: None,
            date_taken: None,
            orientation: None,
            color_space: None,
            exif_data: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// Contract every format handler implements.
///
/// `process_*` methods return `Ok(None)` for recoverable "could not
/// produce" cases (missing embedded data, empty extraction); hard I/O
/// and decode failures are errors.
#[async_trait]
pub trait ImagePlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when every external tool and library the plugin needs is
    /// present. Unavailable plugins are not registered.
    fn is_available(&self) -> bool;

    /// Supported extensions, lowercase with a leading dot.
    fn supported_formats(&self) -> &'static [&'static str];

    fn layout(&self) -> &CacheLayout;

    /// Produce the square cache thumbnail for `path`.
    ///
    /// When `prefetch` (the first bytes of the file, already read) is
    /// supplied, the plugin extracts orientation and, where the format
    /// allows, the embedded thumbnail from the buffer alone — no second
    /// I/O round-trip. Fallbacks are permitted but logged.
    async fn process_thumbnail(
        &self,
        path: &Path,
        content_hash: &str,
        prefetch: Option<&[u8]>,
    ) -> Result<Option<PathBuf>>;

    /// Produce the full-resolution display JPEG in the cache.
    async fn process_view_image(
        &self,
        path: &Path,
        content_hash: &str,
    ) -> Result<Option<PathBuf>>;

    /// Encode a thumbnail from an in-memory or on-disk source, applying
    /// the EXIF orientation.
    async fn generate_thumbnail(
        &self,
        source: encode::ImageSource,
        orientation: u16,
        output: PathBuf,
    ) -> Result<()> {
        encode::write_thumbnail_jpeg(source, orientation, self.layout().thumbnail_size, output)
            .await
    }

    /// Encode a view image from an in-memory or on-disk source, applying
    /// the EXIF orientation.
    async fn generate_view_image(
        &self,
        source: encode::ImageSource,
        orientation: u16,
        output: PathBuf,
    ) -> Result<()> {
        encode::write_view_jpeg(source, orientation, output).await
    }

    /// Fast header scan: at least orientation and rating. The XMP
    /// sidecar is consulted last so its values override anything
    /// embedded.
    async fn extract_metadata(&self, path: &Path) -> Result<Option<FastMetadata>> {
        let head = read_head(path, CONTENT_HASH_BYTES).await?;
        let mut fast = FastMetadata {
            orientation: Some(exif::scan_orientation(&head)),
            rating: exif::scan_embedded_xmp_rating(&head),
        };
        if let Some(fields) = sidecar::read_sidecar(path).await
            && let Some(rating) = fields.rating
            && (0..=5).contains(&rating)
        {
            fast.rating = Some(rating as u8);
        }
        Ok(Some(fast))
    }

    /// Deep extraction for the deferred `meta_full` tier. Formats
    /// without a native parser return `None`.
    async fn extract_full_metadata(&self, _path: &Path) -> Result<Option<FullMetadata>> {
        Ok(None)
    }

    /// Persist a rating to the XMP sidecar next to the file. The source
    /// image itself is never written.
    async fn write_rating(&self, path: &Path, rating: u8) -> Result<()> {
        sidecar::write_rating(path, rating).await
    }

    /// Replace the sidecar's Subject list with `tags`.
    async fn write_tags(&self, path: &Path, tags: &[String]) -> Result<()> {
        sidecar::write_tags(path, tags).await
    }
}

/// Extension → plugin mapping, frozen after startup.
#[derive(Default)]
pub struct PluginRegistry {
    format_map: HashMap<String, Arc<dyn ImagePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin for its formats. Unavailable plugins are
    /// skipped; re-registered extensions are overridden with a warning.
    pub fn register(&mut self, plugin: Arc<dyn ImagePlugin>) {
        if !plugin.is_available() {
            warn!(plugin = plugin.name(), "plugin unavailable, not registering");
            return;
        }
        for extension in plugin.supported_formats() {
            if let Some(previous) = self
                .format_map
                .insert((*extension).to_string(), Arc::clone(&plugin))
            {
                warn!(
                    extension,
                    previous = previous.name(),
                    next = plugin.name(),
                    "format already registered, overriding"
                );
            }
        }
        info!(
            plugin = plugin.name(),
            formats = ?plugin.supported_formats(),
            "plugin registered"
        );
    }

    pub fn plugin_for(&self, extension: &str) -> Option<Arc<dyn ImagePlugin>> {
        let key = if extension.starts_with('.') {
            extension.to_lowercase()
        } else {
            format!(".{}", extension.to_lowercase())
        };
        self.format_map.get(&key).cloned()
    }

    pub fn plugin_for_path(&self, path: &Path) -> Option<Arc<dyn ImagePlugin>> {
        let extension = dotted_extension(path)?;
        self.format_map.get(&extension).cloned()
    }

    pub fn supported_formats(&self) -> HashSet<String> {
        self.format_map.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.format_map.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("formats", &self.supported_formats())
            .finish()
    }
}

/// Read the prefetch window of a file in one sequential pass.
pub async fn read_prefetch(path: &Path) -> Result<Vec<u8>> {
    read_head(path, PREFETCH_BYTES).await
}

async fn read_head(path: &Path, limit: usize) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; limit];
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
    debug!(path = %path.display(), bytes = filled, "read file head");
    Ok(buf)
}
