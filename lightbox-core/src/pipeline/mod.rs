//! Pipeline orchestrator: one high-level intent per call, translated
//! into scheduler operations.
//!
//! Fixed task-id strings are the scheduler's dedup keys; reuse is
//! intentional. The thumbnail task id is the file path itself.

mod indexer;
mod scanner;
mod tasks;

pub use indexer::BackgroundIndexer;
pub use scanner::DirectoryScanner;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use lightbox_config::ScanConfig;
use lightbox_protocol::{Notification, Priority};
use tracing::{debug, info, warn};

use crate::cache::CacheSizeManager;
use crate::error::{CoreError, Result};
use crate::notifications::NotificationSender;
use crate::plugins::PluginRegistry;
use crate::scheduler::{TaskId, TaskScheduler};
use crate::session::ActiveSession;
use crate::store::MetadataStore;
use crate::volume::VolumeHealth;
use crate::watcher::WatchGuard;

pub fn thumbnail_task_id(path: &Path) -> TaskId {
    path.to_string_lossy().into_owned()
}

pub fn meta_task_id(path: &Path) -> TaskId {
    format!("meta::{}", path.display())
}

pub fn meta_full_task_id(path: &Path) -> TaskId {
    format!("meta_full::{}", path.display())
}

pub fn view_task_id(path: &Path) -> TaskId {
    format!("view::{}", path.display())
}

pub fn content_hash_task_id(path: &Path) -> TaskId {
    format!("content_hash::{}", path.display())
}

pub fn jit_cleanup_task_id(path: &Path) -> TaskId {
    format!("jit-cleanup::{}", path.display())
}

pub fn exif_rating_task_id(path: &Path) -> TaskId {
    format!("exif_rating::{}", path.display())
}

pub fn exif_tags_task_id(path: &Path) -> TaskId {
    format!("exif_tags::{}", path.display())
}

pub fn sidecar_reread_task_id(path: &Path) -> TaskId {
    format!("sidecar_reread::{}", path.display())
}

pub fn db_cleanup_deleted_task_id(path: &Path) -> TaskId {
    format!("db_cleanup_deleted::{}", path.display())
}

/// Startup database cleanup runs in chunks of this many paths.
pub(crate) const DB_CLEANUP_CHUNK: usize = 250;

pub struct PipelineOrchestrator {
    pub(crate) scheduler: Arc<TaskScheduler>,
    pub(crate) store: Arc<MetadataStore>,
    pub(crate) registry: Arc<PluginRegistry>,
    pub(crate) cache: Arc<CacheSizeManager>,
    pub(crate) volumes: Arc<VolumeHealth>,
    pub(crate) notifications: NotificationSender,
    pub(crate) active_session: ActiveSession,
    pub(crate) watch_guard: Arc<WatchGuard>,
    pub(crate) min_file_size: u64,
    pub(crate) ignore: GlobSet,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        store: Arc<MetadataStore>,
        registry: Arc<PluginRegistry>,
        cache: Arc<CacheSizeManager>,
        volumes: Arc<VolumeHealth>,
        notifications: NotificationSender,
        active_session: ActiveSession,
        watch_guard: Arc<WatchGuard>,
        scan: &ScanConfig,
    ) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &scan.ignore_patterns {
            builder.add(
                Glob::new(pattern)
                    .map_err(|err| CoreError::Internal(format!("bad ignore pattern: {err}")))?,
            );
        }
        let ignore = builder
            .build()
            .map_err(|err| CoreError::Internal(format!("ignore set: {err}")))?;
        Ok(Self {
            scheduler,
            store,
            registry,
            cache,
            volumes,
            notifications,
            active_session,
            watch_guard,
            min_file_size: scan.min_file_size,
            ignore,
        })
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn watch_guard(&self) -> &Arc<WatchGuard> {
        &self.watch_guard
    }

    pub fn supported_formats(&self) -> HashSet<String> {
        self.registry.supported_formats()
    }

    // ── Preview intents ─────────────────────────────────────────────────

    /// Request a thumbnail for one path.
    ///
    /// Trust-cache fast path: a recorded thumbnail emits `previews_ready`
    /// immediately — no source stat, no tasks; staleness is caught by the
    /// background revalidation walk. Otherwise the existing task is
    /// upgraded (stamping the session for the later view step) or fresh
    /// thumbnail + metadata tasks are submitted.
    pub async fn request_thumbnail(
        self: &Arc<Self>,
        path: &str,
        priority: Priority,
        session_id: Option<&str>,
    ) -> bool {
        if path.is_empty() {
            return false;
        }
        if let Ok(Some(cached)) = self.store.preview_paths(path).await
            && cached.thumbnail_path.is_some()
        {
            self.notifications.send(Notification::previews_ready(
                path,
                cached.thumbnail_path,
                cached.view_image_path,
            ));
            return true;
        }

        let file = Path::new(path);
        let thumb_id = thumbnail_task_id(file);
        let existing = self
            .scheduler
            .stamp_sessions([thumb_id.clone()], session_id);
        if !existing.is_empty() {
            self.scheduler
                .update_task_priorities([thumb_id, meta_task_id(file)], priority);
            debug!(path, priority = %priority, "upgraded preview tasks");
        } else {
            // The background scanner has not reached this file yet;
            // submit directly without the stat-heavy pre-checks — the
            // task bodies revalidate on a worker thread.
            self.scheduler.submit_task(self.thumbnail_spec(
                file,
                priority,
                session_id.map(str::to_string),
            ));
            self.scheduler
                .submit_task(self.meta_spec(file, priority));
            debug!(path, priority = %priority, "submitted on-demand preview tasks");
        }
        true
    }

    /// Batch variant: one store query for cache hits, one graph lock for
    /// the dedup check, one upgrade call for tasks already present.
    pub async fn batch_request_thumbnails(
        self: &Arc<Self>,
        paths: &[String],
        priority: Priority,
        session_id: Option<&str>,
    ) -> usize {
        if paths.is_empty() {
            return 0;
        }
        let cached = self
            .store
            .batch_cached_previews(paths)
            .await
            .unwrap_or_default();
        for (path, previews) in &cached {
            self.notifications.send(Notification::previews_ready(
                path,
                previews.thumbnail_path.clone(),
                previews.view_image_path.clone(),
            ));
        }

        let misses: Vec<&String> = paths.iter().filter(|p| !cached.contains_key(*p)).collect();
        let existing = self.scheduler.stamp_sessions(
            misses.iter().map(|p| thumbnail_task_id(Path::new(p.as_str()))),
            session_id,
        );

        let mut to_upgrade: Vec<TaskId> = Vec::new();
        for path in &misses {
            let file = Path::new(path.as_str());
            let thumb_id = thumbnail_task_id(file);
            if existing.contains(&thumb_id) {
                to_upgrade.push(thumb_id);
                to_upgrade.push(meta_task_id(file));
            } else {
                self.scheduler.submit_task(self.thumbnail_spec(
                    file,
                    priority,
                    session_id.map(str::to_string),
                ));
                self.scheduler.submit_task(self.meta_spec(file, priority));
            }
        }
        if !to_upgrade.is_empty() {
            self.scheduler.update_task_priorities(to_upgrade, priority);
        }
        paths.len()
    }

    /// Request the full-resolution view image. Returns the cached path
    /// immediately when present; otherwise creates or upgrades the view
    /// task at FULLRES_REQUEST and returns `None`.
    pub async fn request_view_image(
        self: &Arc<Self>,
        path: &str,
        session_id: Option<&str>,
    ) -> Option<String> {
        if path.is_empty() {
            return None;
        }
        if let Ok(Some(cached)) = self.store.preview_paths(path).await
            && let Some(view) = cached.view_image_path
            && tokio::fs::try_exists(&view).await.unwrap_or(false)
        {
            return Some(view);
        }

        let file = Path::new(path);
        let view_id = view_task_id(file);
        let existing = self.scheduler.stamp_sessions([view_id.clone()], session_id);
        if !existing.is_empty() {
            self.scheduler
                .update_task_priorities([view_id], Priority::FullresRequest);
            debug!(path, "upgraded view-image task to FULLRES_REQUEST");
        } else {
            self.scheduler.submit_task(self.view_spec(
                file,
                Priority::FullresRequest,
                session_id.map(str::to_string),
                None,
            ));
            debug!(path, "submitted FULLRES_REQUEST view-image task");
        }
        None
    }

    /// Push thumbnail + metadata tasks for off-screen images down.
    pub fn downgrade_thumbnail_tasks(&self, paths: &[String], priority: Priority) {
        let mut ids: Vec<TaskId> = Vec::with_capacity(paths.len() * 2);
        for path in paths {
            let file = Path::new(path);
            ids.push(thumbnail_task_id(file));
            ids.push(meta_task_id(file));
        }
        self.scheduler.downgrade_task_priorities(ids, priority);
    }

    /// Submit or upgrade a speculative view-image task for pre-caching,
    /// carrying a cancel token the caller can revoke.
    pub async fn request_speculative_fullres(
        self: &Arc<Self>,
        path: &str,
        priority: Priority,
        session_id: Option<&str>,
    ) {
        if let Ok(Some(cached)) = self.store.preview_paths(path).await
            && let Some(view) = cached.view_image_path
            && tokio::fs::try_exists(&view).await.unwrap_or(false)
        {
            return;
        }
        let file = Path::new(path);
        let view_id = view_task_id(file);
        // Reuse the existing token so an in-flight cancel keeps working
        // across the upgrade; the submit path preserves it anyway.
        let token = self
            .scheduler
            .task_cancel_token(&view_id)
            .unwrap_or_default();
        self.scheduler.submit_task(self.view_spec(
            file,
            priority,
            session_id.map(str::to_string),
            Some(token),
        ));
    }

    pub fn cancel_speculative_fullres(&self, path: &str) {
        self.scheduler.cancel_task(&view_task_id(Path::new(path)));
    }

    pub fn cancel_speculative_fullres_batch(&self, paths: &[String]) {
        let ids: Vec<TaskId> = paths
            .iter()
            .map(|p| view_task_id(Path::new(p)))
            .collect();
        self.scheduler
            .cancel_tasks(ids.iter().map(String::as_str));
    }

    /// Submit or upgrade metadata extraction for a list of images.
    pub async fn request_metadata_extraction(
        self: &Arc<Self>,
        paths: &[String],
        priority: Priority,
    ) {
        info!(count = paths.len(), priority = %priority, "queueing metadata extraction");
        for path in paths {
            let file = Path::new(path);
            if tokio::fs::try_exists(file).await.unwrap_or(false) {
                self.scheduler.submit_task(self.meta_spec(file, priority));
            }
        }
    }

    // ── Sidecar write intents ───────────────────────────────────────────

    /// Queue an XMP sidecar rating write for a file whose database row
    /// was already updated.
    pub fn queue_rating_write(self: &Arc<Self>, path: &str, rating: u8, priority: Priority) {
        let file = Path::new(path);
        self.scheduler
            .submit_task(self.rating_write_spec(file, rating, priority));
    }

    /// Queue an XMP sidecar Subject-list replacement.
    pub fn queue_tags_write(self: &Arc<Self>, path: &str, tags: Vec<String>, priority: Priority) {
        let file = Path::new(path);
        self.scheduler
            .submit_task(self.tags_write_spec(file, tags, priority));
    }

    // ── Startup maintenance ─────────────────────────────────────────────

    /// Non-blocking chunked cleanup of records whose files vanished.
    pub async fn start_chunked_db_cleanup(self: &Arc<Self>) {
        let Ok(all_paths) = self.store.get_all_file_paths().await else {
            warn!("could not list database paths for cleanup");
            return;
        };
        if all_paths.is_empty() {
            info!("no records in database to check");
            return;
        }
        info!(
            records = all_paths.len(),
            chunk = DB_CLEANUP_CHUNK,
            "starting chunked database cleanup"
        );
        for (index, chunk) in all_paths.chunks(DB_CLEANUP_CHUNK).enumerate() {
            self.scheduler.submit_task(self.db_cleanup_chunk_spec(index, chunk.to_vec()));
        }
    }
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("formats", &self.registry.supported_formats().len())
            .finish_non_exhaustive()
    }
}
