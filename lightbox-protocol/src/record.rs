//! Per-image metadata record as it crosses the wire.

use serde::{Deserialize, Serialize};

/// Full metadata row for one image, keyed by its absolute `file_path`.
///
/// Timestamps are float Unix seconds; `accessed_at` is the LRU key for
/// cache eviction. `exif_data` carries the full key/value set from the last
/// deep extraction as an opaque JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub file_path: String,
    pub path_hash: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub rating: i64,
    #[serde(default)]
    pub camera_make: Option<String>,
    #[serde(default)]
    pub camera_model: Option<String>,
    #[serde(default)]
    pub lens_model: Option<String>,
    #[serde(default)]
    pub focal_length: Option<f64>,
    #[serde(default)]
    pub aperture: Option<f64>,
    #[serde(default)]
    pub shutter_speed: Option<String>,
    #[serde(default)]
    pub iso: Option<i64>,
    #[serde(default)]
    pub date_taken: Option<String>,
    #[serde(default)]
    pub orientation: Option<i64>,
    #[serde(default)]
    pub color_space: Option<String>,
    #[serde(default)]
    pub thumbnail_path: Option<String>,
    #[serde(default)]
    pub view_image_path: Option<String>,
    #[serde(default)]
    pub exif_data: Option<serde_json::Value>,
    pub mtime: f64,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(default)]
    pub accessed_at: f64,
}
