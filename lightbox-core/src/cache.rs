//! On-disk cache byte accounting and reactive LRU eviction.
//!
//! Background scans pause while the cache is over its limit (callers
//! check [`CacheSizeManager::is_full`]); GUI-driven writes instead report
//! bytes via [`CacheSizeManager::record_write`], which evicts reactively
//! down to a headroom below the limit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;
use crate::store::MetadataStore;

/// Evict down to 90% of the limit to avoid thrashing at the boundary.
const HEADROOM_RATIO: f64 = 0.90;

pub struct CacheSizeManager {
    store: Arc<MetadataStore>,
    max_bytes: u64,
    current_bytes: Mutex<u64>,
    evicting: AtomicBool,
}

impl CacheSizeManager {
    /// `max_size_mb == 0` disables accounting entirely.
    pub async fn new(store: Arc<MetadataStore>, max_size_mb: u64) -> Result<Self> {
        let manager = Self {
            store,
            max_bytes: max_size_mb * 1024 * 1024,
            current_bytes: Mutex::new(0),
            evicting: AtomicBool::new(false),
        };
        if manager.enabled() {
            manager.refresh().await?;
            info!(
                limit_mb = max_size_mb,
                current_mb = *manager.current_bytes.lock() / (1024 * 1024),
                "cache size manager ready"
            );
        } else {
            info!("no cache size limit configured");
        }
        Ok(manager)
    }

    pub fn enabled(&self) -> bool {
        self.max_bytes > 0
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn current_bytes(&self) -> u64 {
        *self.current_bytes.lock()
    }

    /// True when the cache is at or over its limit; background scans
    /// check this and park themselves.
    pub fn is_full(&self) -> bool {
        self.enabled() && *self.current_bytes.lock() >= self.max_bytes
    }

    /// Account for a newly written cache file; evicts if the limit is now
    /// exceeded. Returns bytes freed (0 when no eviction ran).
    pub async fn record_write(&self, bytes_added: u64) -> Result<u64> {
        if !self.enabled() {
            return Ok(0);
        }
        *self.current_bytes.lock() += bytes_added;
        self.evict_if_needed().await
    }

    async fn evict_if_needed(&self) -> Result<u64> {
        {
            let current = self.current_bytes.lock();
            if *current < self.max_bytes {
                return Ok(0);
            }
        }
        // A single evictor at a time; concurrent writers skip.
        if self.evicting.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let target = (self.max_bytes as f64 * HEADROOM_RATIO) as u64;
        let result = self.store.evict_lru_cache(target).await;
        // Resync from disk regardless of partial failure so the counter
        // cannot drift permanently above the limit.
        let refresh = self.refresh().await;
        self.evicting.store(false, Ordering::SeqCst);

        let freed = result?;
        refresh?;
        if freed > 0 {
            info!(freed_mb = freed / (1024 * 1024), "cache evicted");
        }
        Ok(freed)
    }

    /// Re-read the on-disk total from the store.
    pub async fn refresh(&self) -> Result<()> {
        let total = self.store.get_total_cache_size().await?;
        *self.current_bytes.lock() = total;
        Ok(())
    }
}

impl std::fmt::Debug for CacheSizeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSizeManager")
            .field("max_bytes", &self.max_bytes)
            .field("current_bytes", &self.current_bytes())
            .finish()
    }
}
