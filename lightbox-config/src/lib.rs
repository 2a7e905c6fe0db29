//! Configuration for the lightbox daemon.
//!
//! A single TOML file describes the daemon: socket path, cache location,
//! watch paths, worker count, and tuning knobs for volume probes and cache
//! pressure. Loading is tolerant: a missing file yields defaults, a broken
//! file is a hard error so misconfiguration never fails silently.

pub mod loader;
pub mod models;

pub use loader::{ConfigError, load, load_from_path};
pub use models::{CacheConfig, Config, DaemonConfig, ScanConfig, VolumeConfig};
