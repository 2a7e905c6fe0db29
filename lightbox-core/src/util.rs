//! Small shared helpers: wall-clock seconds and file fingerprints.

use std::path::Path;
use std::time::UNIX_EPOCH;

use md5::{Digest, Md5};

/// Bytes read into the prefetch buffer in a single I/O call.
pub const PREFETCH_BYTES: usize = 512 * 1024;

/// Bytes of the file head that feed the content hash. Kept separate from
/// [`PREFETCH_BYTES`] so digests stay compatible with cache files written
/// by earlier runs.
pub const CONTENT_HASH_BYTES: usize = 256 * 1024;

/// Current wall clock as float Unix seconds, the timestamp format of the
/// metadata store.
pub fn unix_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Seconds-since-epoch of a filesystem mtime.
pub fn mtime_seconds(metadata: &std::fs::Metadata) -> f64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Nanoseconds-since-epoch of a filesystem mtime, used in the path hash so
/// sub-second edits still change the fingerprint.
fn mtime_nanos(metadata: &std::fs::Metadata) -> u128 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Fast file-identity fingerprint over `(path, size, mtime)`. Never reads
/// the file itself.
pub fn path_hash(path: &Path, metadata: &std::fs::Metadata) -> String {
    let mut hasher = Md5::new();
    hasher.update(
        format!(
            "{}-{}-{}",
            path.display(),
            metadata.len(),
            mtime_nanos(metadata)
        )
        .as_bytes(),
    );
    hex(&hasher.finalize())
}

/// Content hash over the head of the file; cache files are named by it.
pub fn content_hash(head: &[u8]) -> String {
    let take = head.len().min(CONTENT_HASH_BYTES);
    let mut hasher = Md5::new();
    hasher.update(&head[..take]);
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Lowercased extension with a leading dot, the plugin registry's key.
pub fn dotted_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
}
