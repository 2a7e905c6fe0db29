//! Typed configuration model with serde defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &Path) -> PathBuf {
    let Some(text) = path.to_str() else {
        return path.to_path_buf();
    };
    if let Some(rest) = text.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    if text == "~"
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home);
    }
    path.to_path_buf()
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub cache: CacheConfig,
    pub scan: ScanConfig,
    pub volumes: VolumeConfig,
}

impl Config {
    /// Resolve `~`-relative paths against the environment. Called once by
    /// the loader; tests may call it on hand-built configs.
    pub fn resolve_paths(mut self) -> Self {
        self.daemon.socket_path = expand_tilde(&self.daemon.socket_path);
        self.cache.dir = expand_tilde(&self.cache.dir);
        self.scan.watch_paths = self
            .scan
            .watch_paths
            .iter()
            .map(|p| expand_tilde(p))
            .collect();
        self
    }

    /// Path of the SQLite index inside the cache directory.
    pub fn database_path(&self) -> PathBuf {
        self.cache.dir.join("metadata.db")
    }

    /// Path of the single-instance pid file inside the cache directory.
    pub fn pid_file_path(&self) -> PathBuf {
        self.cache.dir.join("daemon.pid")
    }
}

/// Daemon process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix-domain socket the GUI connects to.
    pub socket_path: PathBuf,
    /// Number of scheduler workers servicing the priority queue.
    pub workers: usize,
    /// Default tracing filter when `LIGHTBOX_LOG` is unset.
    pub log_filter: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("~/.lightbox/daemon.sock"),
            workers: 8,
            log_filter: "info".to_string(),
        }
    }
}

/// Cache tree and eviction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root of the cache tree (`thumbnails/`, `images/`, the database and
    /// the pid file all live under it).
    pub dir: PathBuf,
    /// Upper bound for thumbnail + view-image bytes on disk; `0` disables
    /// accounting and eviction entirely.
    pub max_size_mb: u64,
    /// Edge length of generated square thumbnails.
    pub thumbnail_size: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("~/.lightbox/cache"),
            max_size_mb: 0,
            thumbnail_size: 64,
        }
    }
}

/// Discovery and indexing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Directories indexed at startup and watched for live changes.
    pub watch_paths: Vec<PathBuf>,
    /// Files smaller than this are never indexed (web icons, sidecars of
    /// other tools, thumbnails of thumbnails).
    pub min_file_size: u64,
    /// Glob patterns (matched against the file name) that exclude files.
    pub ignore_patterns: Vec<String>,
    /// Files yielded per source-job slice.
    pub batch_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            watch_paths: Vec::new(),
            min_file_size: 8192,
            ignore_patterns: vec!["._*".to_string()],
            batch_size: 10,
        }
    }
}

/// Network-volume health probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Roots whose immediate children are treated as mount points; paths
    /// outside these roots are considered always accessible.
    pub mount_roots: Vec<PathBuf>,
    /// Probe timeout in milliseconds; a mount that does not answer a stat
    /// within it is marked unreachable.
    pub probe_timeout_ms: u64,
    /// Seconds a probe verdict is cached per mount point.
    pub cache_ttl_secs: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            mount_roots: vec![
                PathBuf::from("/Volumes"),
                PathBuf::from("/mnt"),
                PathBuf::from("/media"),
            ],
            probe_timeout_ms: 2000,
            cache_ttl_secs: 60,
        }
    }
}
