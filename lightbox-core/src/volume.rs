//! Per-mount-point health bit for network volumes.
//!
//! A stat probe that does not answer within a short timeout marks the
//! mount unreachable; the verdict is cached per mount so a dead NAS costs
//! one timeout per minute, not one per file. Local paths are always
//! accessible and never probed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lightbox_config::VolumeConfig;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

pub struct VolumeHealth {
    mount_roots: Vec<PathBuf>,
    probe_timeout: Duration,
    cache_ttl: Duration,
    cache: Mutex<HashMap<PathBuf, (bool, Instant)>>,
}

impl VolumeHealth {
    pub fn new(config: &VolumeConfig) -> Self {
        Self {
            mount_roots: config.mount_roots.clone(),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The `<root>/<volume>` mount point containing `path`, or `None`
    /// for local paths.
    fn mount_point(&self, path: &Path) -> Option<PathBuf> {
        for root in &self.mount_roots {
            if let Ok(rest) = path.strip_prefix(root)
                && let Some(first) = rest.components().next()
            {
                return Some(root.join(first));
            }
        }
        None
    }

    /// Whether the volume holding `path` currently answers stat calls.
    ///
    /// Callers that bail out on `false` must not requeue the skipped
    /// work; the file is picked up again by the next scan or watcher
    /// event.
    pub async fn accessible(&self, path: &Path) -> bool {
        let Some(mount) = self.mount_point(path) else {
            return true;
        };
        let now = Instant::now();
        if let Some((verdict, expires)) = self.cache.lock().get(&mount).copied()
            && now < expires
        {
            return verdict;
        }

        let probe_target = mount.clone();
        let probe = tokio::task::spawn_blocking(move || {
            std::fs::metadata(&probe_target).is_ok()
        });
        let verdict = match tokio::time::timeout(self.probe_timeout, probe).await {
            Ok(Ok(ok)) => ok,
            // Timed out or the probe thread died: treat the volume as
            // down. The orphaned blocking stat finishes on its own.
            _ => false,
        };

        self.cache
            .lock()
            .insert(mount.clone(), (verdict, now + self.cache_ttl));
        if !verdict {
            warn!(mount = %mount.display(), "volume inaccessible; skipping work on it");
        }
        verdict
    }
}

impl std::fmt::Debug for VolumeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeHealth")
            .field("mount_roots", &self.mount_roots)
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}
