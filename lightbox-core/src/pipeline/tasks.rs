//! Task bodies, spec builders and per-file task factories.
//!
//! Bodies hold a `Weak` reference back to the orchestrator: the graph
//! owns the closures and the orchestrator owns the scheduler, so strong
//! references here would cycle. A body whose orchestrator is gone
//! completes as a no-op.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use lightbox_protocol::{Notification, Priority};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::plugins::{read_prefetch, sidecar};
use crate::scheduler::{TaskContext, TaskFactory, TaskOutput, TaskSpec, task_fn};
use crate::util::{CONTENT_HASH_BYTES, content_hash};

use super::{
    PipelineOrchestrator, content_hash_task_id, db_cleanup_deleted_task_id, exif_rating_task_id,
    exif_tags_task_id, jit_cleanup_task_id, meta_full_task_id, meta_task_id,
    sidecar_reread_task_id, thumbnail_task_id, view_task_id,
};

/// Wrap an orchestrator method as a task function via a weak handle.
/// Listed captures are cloned per invocation so the closure stays `Fn`
/// and survives dedup re-queues.
macro_rules! pipeline_task {
    ($pipeline:expr, [$($capture:ident),*], |$p:ident, $ctx:ident| $call:expr) => {{
        let weak: Weak<PipelineOrchestrator> = Arc::downgrade($pipeline);
        task_fn(move |$ctx: TaskContext| {
            let weak = weak.clone();
            $(let $capture = $capture.clone();)*
            async move {
                match weak.upgrade() {
                    Some($p) => $call.await,
                    None => Ok(TaskOutput::None),
                }
            }
        })
    }};
}

impl PipelineOrchestrator {
    // ── Spec builders ───────────────────────────────────────────────────

    pub(crate) fn thumbnail_spec(
        self: &Arc<Self>,
        path: &Path,
        priority: Priority,
        session_id: Option<String>,
    ) -> TaskSpec {
        let task_id = thumbnail_task_id(path);
        let path = path.to_path_buf();
        let func = pipeline_task!(self, [path], |p, ctx| p.thumbnail_task(path, ctx));
        TaskSpec::new(task_id, priority, func).with_session(session_id)
    }

    pub(crate) fn meta_spec(self: &Arc<Self>, path: &Path, priority: Priority) -> TaskSpec {
        let task_id = meta_task_id(path);
        let path = path.to_path_buf();
        let func = pipeline_task!(self, [path], |p, _ctx| p.metadata_task(path));
        TaskSpec::new(task_id, priority, func)
    }

    pub(crate) fn meta_full_spec(self: &Arc<Self>, path: &Path) -> TaskSpec {
        let task_id = meta_full_task_id(path);
        let path = path.to_path_buf();
        let func = pipeline_task!(self, [path], |p, _ctx| p.full_metadata_task(path));
        TaskSpec::new(task_id, Priority::BackgroundScan, func)
    }

    pub(crate) fn view_spec(
        self: &Arc<Self>,
        path: &Path,
        priority: Priority,
        session_id: Option<String>,
        cancel: Option<CancellationToken>,
    ) -> TaskSpec {
        let task_id = view_task_id(path);
        let path = path.to_path_buf();
        let func = pipeline_task!(self, [path], |p, ctx| p.view_image_task(path, ctx));
        let mut spec = TaskSpec::new(task_id, priority, func).with_session(session_id);
        if let Some(token) = cancel {
            spec = spec.with_cancel(token);
        }
        spec
    }

    pub(crate) fn content_hash_spec(self: &Arc<Self>, path: &Path) -> TaskSpec {
        let task_id = content_hash_task_id(path);
        let path = path.to_path_buf();
        let func = pipeline_task!(self, [path], |p, _ctx| p.content_hash_task(path));
        TaskSpec::new(task_id, Priority::ContentHash, func)
    }

    fn remove_records_spec(
        self: &Arc<Self>,
        task_id: String,
        priority: Priority,
        paths: Vec<String>,
    ) -> TaskSpec {
        let func = pipeline_task!(self, [paths], |p, _ctx| p.remove_records_task(paths));
        TaskSpec::new(task_id, priority, func)
    }

    pub(crate) fn jit_cleanup_spec(self: &Arc<Self>, path: &Path) -> TaskSpec {
        self.remove_records_spec(
            jit_cleanup_task_id(path),
            Priority::High,
            vec![path.to_string_lossy().into_owned()],
        )
    }

    pub(crate) fn db_cleanup_deleted_spec(self: &Arc<Self>, path: &Path) -> TaskSpec {
        self.remove_records_spec(
            db_cleanup_deleted_task_id(path),
            Priority::High,
            vec![path.to_string_lossy().into_owned()],
        )
    }

    pub(crate) fn db_cleanup_chunk_spec(
        self: &Arc<Self>,
        index: usize,
        paths: Vec<String>,
    ) -> TaskSpec {
        let func = pipeline_task!(self, [paths], |p, _ctx| p.db_cleanup_chunk_task(paths));
        TaskSpec::new(format!("db-cleanup-chunk-{index}"), Priority::Low, func)
    }

    pub(crate) fn rating_write_spec(
        self: &Arc<Self>,
        path: &Path,
        rating: u8,
        priority: Priority,
    ) -> TaskSpec {
        let task_id = exif_rating_task_id(path);
        let path = path.to_path_buf();
        let func = pipeline_task!(self, [path], |p, _ctx| p.rating_write_task(path, rating));
        TaskSpec::new(task_id, priority, func)
    }

    pub(crate) fn tags_write_spec(
        self: &Arc<Self>,
        path: &Path,
        tags: Vec<String>,
        priority: Priority,
    ) -> TaskSpec {
        let task_id = exif_tags_task_id(path);
        let path = path.to_path_buf();
        let func = pipeline_task!(self, [path, tags], |p, _ctx| p.tags_write_task(path, tags));
        TaskSpec::new(task_id, priority, func)
    }

    pub(crate) fn sidecar_reread_spec(self: &Arc<Self>, path: &Path) -> TaskSpec {
        let task_id = sidecar_reread_task_id(path);
        let path = path.to_path_buf();
        let func = pipeline_task!(self, [path], |p, _ctx| p.sidecar_reread_task(path));
        TaskSpec::new(task_id, Priority::Low, func)
    }

    // ── Task bodies ─────────────────────────────────────────────────────

    /// Stage A/B: embedded-thumbnail extraction only. `previews_ready`
    /// goes out as soon as the thumbnail exists; the view image is a
    /// separate, slower stage and is never awaited here.
    async fn thumbnail_task(self: Arc<Self>, path: PathBuf, _ctx: TaskContext) -> Result<TaskOutput> {
        let path_text = path.to_string_lossy().into_owned();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(path = %path_text, "file vanished before thumbnail processing; queueing cleanup");
            self.scheduler.submit_task(self.jit_cleanup_spec(&path));
            return Err(CoreError::NotFound(path));
        }
        if !self.volumes.accessible(&path).await {
            return Ok(TaskOutput::None);
        }

        // Another task may have finished this file already.
        if self.store.is_thumbnail_valid(&path_text).await? {
            if let Some(cached) = self.store.preview_paths(&path_text).await? {
                self.notifications.send(Notification::previews_ready(
                    &path_text,
                    cached.thumbnail_path,
                    cached.view_image_path,
                ));
            }
            return Ok(TaskOutput::None);
        }

        let Some(plugin) = self.registry.plugin_for_path(&path) else {
            error!(path = %path_text, "no plugin for file");
            return Ok(TaskOutput::None);
        };

        let head = read_prefetch(&path).await?;
        let hash = content_hash(&head);
        let thumbnail = plugin
            .process_thumbnail(&path, &hash, Some(&head))
            .await
            .map_err(|err| {
                error!(path = %path_text, plugin = plugin.name(), error = %err, "thumbnail processing failed");
                err
            })?;

        match &thumbnail {
            Some(thumb) => {
                self.store
                    .set_thumbnail_paths(&path_text, Some(&thumb.to_string_lossy()), None)
                    .await?;
                self.record_cache_write(thumb).await;
            }
            None => error!(path = %path_text, "thumbnail generation produced no output"),
        }

        // Include a view path from a prior run, if one is on record.
        let existing_view = self
            .store
            .preview_paths(&path_text)
            .await?
            .and_then(|p| p.view_image_path);
        self.notifications.send(Notification::previews_ready(
            &path_text,
            thumbnail
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            existing_view,
        ));

        Ok(thumbnail.map(TaskOutput::CachePath).unwrap_or_default())
    }

    /// Stage C: the expensive full-resolution decode. Checks the session
    /// guard and cancel token before committing a worker to it.
    async fn view_image_task(self: Arc<Self>, path: PathBuf, ctx: TaskContext) -> Result<TaskOutput> {
        let path_text = path.to_string_lossy().into_owned();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(path = %path_text, "file vanished before view-image processing; queueing cleanup");
            self.scheduler.submit_task(self.jit_cleanup_spec(&path));
            return Err(CoreError::NotFound(path));
        }
        if !self.volumes.accessible(&path).await {
            return Ok(TaskOutput::None);
        }

        if let Some(cached) = self.store.preview_paths(&path_text).await?
            && let Some(view) = cached.view_image_path
            && tokio::fs::try_exists(&view).await.unwrap_or(false)
        {
            return Ok(TaskOutput::CachePath(PathBuf::from(view)));
        }

        // Session guard: the user has navigated away, don't burn a worker
        // on a stale full-resolution decode.
        if let Some(expected) = &ctx.session_id
            && !self.active_session.matches(expected)
        {
            debug!(path = %path_text, session = %expected, "session changed; skipping view image");
            return Ok(TaskOutput::None);
        }
        if ctx.cancel.is_cancelled() {
            return Ok(TaskOutput::None);
        }

        let Some(plugin) = self.registry.plugin_for_path(&path) else {
            error!(path = %path_text, "no plugin for file");
            return Ok(TaskOutput::None);
        };
        let head = read_head_for_hash(&path).await?;
        let hash = content_hash(&head);

        let view = plugin
            .process_view_image(&path, &hash)
            .await
            .map_err(|err| {
                error!(path = %path_text, plugin = plugin.name(), error = %err, "view-image processing failed");
                err
            })?;
        let Some(view) = view else {
            error!(path = %path_text, "view-image generation produced no output");
            return Ok(TaskOutput::None);
        };

        self.store
            .set_thumbnail_paths(&path_text, None, Some(&view.to_string_lossy()))
            .await?;
        self.record_cache_write(&view).await;

        let thumbnail = self
            .store
            .preview_paths(&path_text)
            .await?
            .and_then(|p| p.thumbnail_path);
        self.notifications.send(Notification::previews_ready(
            &path_text,
            thumbnail,
            Some(view.to_string_lossy().into_owned()),
        ));
        Ok(TaskOutput::CachePath(view))
    }

    /// Fast metadata tier: header scan plus sidecar override. Queues the
    /// deep tier and the content-hash backfill as background work when
    /// needed.
    async fn metadata_task(self: Arc<Self>, path: PathBuf) -> Result<TaskOutput> {
        let path_text = path.to_string_lossy().into_owned();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(path = %path_text, "file vanished before metadata extraction; queueing cleanup");
            self.scheduler.submit_task(self.jit_cleanup_spec(&path));
            return Err(CoreError::NotFound(path));
        }
        if !self.volumes.accessible(&path).await {
            return Ok(TaskOutput::None);
        }

        let Some(plugin) = self.registry.plugin_for_path(&path) else {
            return Ok(TaskOutput::None);
        };
        let fast = plugin.extract_metadata(&path).await?.unwrap_or_default();
        self.store.apply_fast_metadata(&path_text, &fast).await?;

        if self.store.needs_full_metadata(&path_text).await? {
            self.scheduler.submit_task(self.meta_full_spec(&path));
        }
        let record = self.store.get(&path_text).await?;
        if record.is_some_and(|r| r.content_hash.is_none()) {
            self.scheduler.submit_task(self.content_hash_spec(&path));
        }
        Ok(TaskOutput::None)
    }

    /// Deep metadata tier, deferred to BACKGROUND_SCAN.
    async fn full_metadata_task(self: Arc<Self>, path: PathBuf) -> Result<TaskOutput> {
        let path_text = path.to_string_lossy().into_owned();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(TaskOutput::None);
        }
        if !self.volumes.accessible(&path).await {
            return Ok(TaskOutput::None);
        }
        // Another worker may have done this between scheduling and now.
        if !self.store.needs_full_metadata(&path_text).await? {
            return Ok(TaskOutput::None);
        }
        let Some(plugin) = self.registry.plugin_for_path(&path) else {
            return Ok(TaskOutput::None);
        };
        if let Some(full) = plugin.extract_full_metadata(&path).await? {
            self.store.store_full_metadata(&path_text, &full).await?;
            debug!(path = %path_text, "full metadata stored");
        }
        Ok(TaskOutput::None)
    }

    /// Digest the file head and record it; survives moves and renames.
    async fn content_hash_task(self: Arc<Self>, path: PathBuf) -> Result<TaskOutput> {
        let path_text = path.to_string_lossy().into_owned();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(TaskOutput::None);
        }
        if !self.volumes.accessible(&path).await {
            return Ok(TaskOutput::None);
        }
        let head = read_head_for_hash(&path).await?;
        self.store
            .set_content_hash(&path_text, &content_hash(&head))
            .await?;
        Ok(TaskOutput::None)
    }

    async fn remove_records_task(self: Arc<Self>, paths: Vec<String>) -> Result<TaskOutput> {
        let removed = self.store.remove_records(&paths).await?;
        if removed > 0 {
            self.notifications.send(Notification::files_removed(paths));
        }
        Ok(TaskOutput::None)
    }

    /// Check one chunk of known paths for existence; drop stale records.
    /// The first path samples volume health for the whole chunk so a
    /// dead NAS costs one timeout, not one per path.
    async fn db_cleanup_chunk_task(self: Arc<Self>, paths: Vec<String>) -> Result<TaskOutput> {
        if let Some(sample) = paths.first()
            && !self.volumes.accessible(Path::new(sample)).await
        {
            warn!(sample = %sample, "skipping cleanup chunk; volume inaccessible");
            return Ok(TaskOutput::None);
        }
        let mut missing = Vec::new();
        for path in paths {
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                missing.push(path);
            }
        }
        if !missing.is_empty() {
            debug!(count = missing.len(), "removing records for missing files");
            let removed = self.store.remove_records(&missing).await?;
            if removed > 0 {
                self.notifications.send(Notification::files_removed(missing));
            }
        }
        Ok(TaskOutput::None)
    }

    /// Write a rating to the XMP sidecar, with watcher suppression for
    /// the self-inflicted events.
    async fn rating_write_task(self: Arc<Self>, path: PathBuf, rating: u8) -> Result<TaskOutput> {
        self.watch_guard
            .ignore_for_window(sidecar::sidecar_path_for(&path));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(path = %path.display(), "file not found, cannot write rating");
            return Err(CoreError::NotFound(path));
        }
        let Some(plugin) = self.registry.plugin_for_path(&path) else {
            warn!(path = %path.display(), "no plugin available to write rating");
            return Err(CoreError::Plugin {
                plugin: "none",
                path,
                message: "no plugin for format".into(),
            });
        };
        plugin.write_rating(&path, rating).await?;
        info!(path = %path.display(), rating, "rating written to sidecar");
        Ok(TaskOutput::None)
    }

    /// Replace the sidecar Subject list, with watcher suppression.
    async fn tags_write_task(self: Arc<Self>, path: PathBuf, tags: Vec<String>) -> Result<TaskOutput> {
        self.watch_guard
            .ignore_for_window(sidecar::sidecar_path_for(&path));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(path = %path.display(), "file not found, cannot write tags");
            return Err(CoreError::NotFound(path));
        }
        let Some(plugin) = self.registry.plugin_for_path(&path) else {
            warn!(path = %path.display(), "no plugin available to write tags");
            return Err(CoreError::Plugin {
                plugin: "none",
                path,
                message: "no plugin for format".into(),
            });
        };
        plugin.write_tags(&path, &tags).await?;
        info!(path = %path.display(), count = tags.len(), "tags written to sidecar");
        Ok(TaskOutput::None)
    }

    /// Re-run the fast metadata tier after an external sidecar edit.
    async fn sidecar_reread_task(self: Arc<Self>, path: PathBuf) -> Result<TaskOutput> {
        let path_text = path.to_string_lossy().into_owned();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(TaskOutput::None);
        }
        let Some(plugin) = self.registry.plugin_for_path(&path) else {
            return Ok(TaskOutput::None);
        };
        if let Some(fast) = plugin.extract_metadata(&path).await? {
            self.store.apply_fast_metadata(&path_text, &fast).await?;
        }
        Ok(TaskOutput::None)
    }

    /// Report cache bytes written; a triggered eviction frees space, so
    /// parked background producers get another chance.
    async fn record_cache_write(&self, cache_file: &Path) {
        let Ok(metadata) = tokio::fs::metadata(cache_file).await else {
            return;
        };
        match self.cache.record_write(metadata.len()).await {
            Ok(freed) if freed > 0 => self.scheduler.resume_deferred_jobs(),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "cache accounting failed"),
        }
    }

    // ── Pre-checks and factories ────────────────────────────────────────

    /// Existence, ignore patterns, minimum size, format support.
    pub(crate) async fn passes_pre_checks(&self, path: &Path) -> bool {
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            return false;
        };
        if !metadata.is_file() {
            return false;
        }
        if let Some(name) = path.file_name()
            && self.ignore.is_match(Path::new(name))
        {
            debug!(path = %path.display(), "file matches ignore pattern");
            return false;
        }
        if metadata.len() < self.min_file_size {
            debug!(path = %path.display(), size = metadata.len(), "file below minimum size");
            return false;
        }
        self.registry.plugin_for_path(path).is_some()
    }

    /// Factory for GUI scans: metadata + thumbnail per file. Warm-cache
    /// files emit `previews_ready` for GUI-initiated scans instead of
    /// creating tasks.
    pub async fn tasks_for_file(
        self: &Arc<Self>,
        path: &Path,
        priority: Priority,
    ) -> Vec<TaskSpec> {
        if !self.passes_pre_checks(path).await {
            return Vec::new();
        }
        let path_text = path.to_string_lossy().into_owned();
        if self.store.is_thumbnail_valid(&path_text).await.unwrap_or(false) {
            if priority >= Priority::GuiRequestLow
                && let Ok(Some(cached)) = self.store.preview_paths(&path_text).await
            {
                self.notifications.send(Notification::previews_ready(
                    &path_text,
                    cached.thumbnail_path,
                    cached.view_image_path,
                ));
            }
            return Vec::new();
        }
        vec![
            self.meta_spec(path, priority),
            self.thumbnail_spec(path, priority, None),
        ]
    }

    /// Factory for the Stage-C source job: one view-image task per file
    /// that doesn't have its view image yet.
    pub async fn view_image_task_for_file(
        self: &Arc<Self>,
        path: &Path,
        priority: Priority,
    ) -> Vec<TaskSpec> {
        if !self.passes_pre_checks(path).await {
            return Vec::new();
        }
        let path_text = path.to_string_lossy().into_owned();
        if let Ok(Some(cached)) = self.store.preview_paths(&path_text).await
            && let Some(view) = cached.view_image_path
            && tokio::fs::try_exists(&view).await.unwrap_or(false)
        {
            return Vec::new();
        }
        vec![self.view_spec(path, priority, None, None)]
    }

    /// Factory for daemon background indexing: thumbnail, metadata and
    /// view image in one pass.
    pub async fn all_tasks_for_file(
        self: &Arc<Self>,
        path: &Path,
        priority: Priority,
    ) -> Vec<TaskSpec> {
        if !self.passes_pre_checks(path).await {
            return Vec::new();
        }
        let path_text = path.to_string_lossy().into_owned();
        let mut specs = Vec::new();
        if !self.store.is_thumbnail_valid(&path_text).await.unwrap_or(false) {
            specs.push(self.meta_spec(path, priority));
            specs.push(self.thumbnail_spec(path, priority, None));
        }
        let view_missing = match self.store.preview_paths(&path_text).await {
            Ok(Some(cached)) => match cached.view_image_path {
                Some(view) => !tokio::fs::try_exists(&view).await.unwrap_or(false),
                None => true,
            },
            _ => true,
        };
        if view_missing {
            specs.push(self.view_spec(path, priority, None, None));
        }
        specs
    }

    /// Factory for GUI directory loads: like [`Self::all_tasks_for_file`]
    /// but view-image work is pinned at BACKGROUND_SCAN so it only runs
    /// after the thumbnail queue drains.
    pub async fn gui_tasks_for_file(
        self: &Arc<Self>,
        path: &Path,
        priority: Priority,
    ) -> Vec<TaskSpec> {
        if !self.passes_pre_checks(path).await {
            return Vec::new();
        }
        let path_text = path.to_string_lossy().into_owned();
        let mut specs = Vec::new();
        if !self.store.is_thumbnail_valid(&path_text).await.unwrap_or(false) {
            specs.push(self.meta_spec(path, priority));
            specs.push(self.thumbnail_spec(path, priority, None));
        }
        let view_missing = match self.store.preview_paths(&path_text).await {
            Ok(Some(cached)) => match cached.view_image_path {
                Some(view) => !tokio::fs::try_exists(&view).await.unwrap_or(false),
                None => true,
            },
            _ => true,
        };
        if view_missing {
            specs.push(self.view_spec(path, Priority::BackgroundScan, None, None));
        }
        specs
    }

    // ── TaskFactory adapters for source jobs ────────────────────────────

    pub fn standard_task_factory(self: &Arc<Self>) -> TaskFactory {
        let weak = Arc::downgrade(self);
        Arc::new(move |path: PathBuf, priority: Priority| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(pipeline) => pipeline.tasks_for_file(&path, priority).await,
                    None => Vec::new(),
                }
            })
        })
    }

    pub fn view_image_task_factory(self: &Arc<Self>) -> TaskFactory {
        let weak = Arc::downgrade(self);
        Arc::new(move |path: PathBuf, priority: Priority| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(pipeline) => pipeline.view_image_task_for_file(&path, priority).await,
                    None => Vec::new(),
                }
            })
        })
    }

    pub fn all_tasks_factory(self: &Arc<Self>) -> TaskFactory {
        let weak = Arc::downgrade(self);
        Arc::new(move |path: PathBuf, priority: Priority| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(pipeline) => pipeline.all_tasks_for_file(&path, priority).await,
                    None => Vec::new(),
                }
            })
        })
    }

    pub fn gui_task_factory(self: &Arc<Self>) -> TaskFactory {
        let weak = Arc::downgrade(self);
        Arc::new(move |path: PathBuf, priority: Priority| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(pipeline) => pipeline.gui_tasks_for_file(&path, priority).await,
                    None => Vec::new(),
                }
            })
        })
    }

    // ── Watcher entry points ────────────────────────────────────────────

    /// A sidecar was created or edited externally: map it back to its
    /// image and re-extract the fast metadata.
    pub fn handle_sidecar_changed(self: &Arc<Self>, xmp_path: &Path) {
        let supported = self.registry.supported_formats();
        if let Some(image) = sidecar::find_image_for_sidecar(xmp_path, &supported) {
            debug!(image = %image.display(), "sidecar changed, re-extracting metadata");
            self.scheduler.submit_task(self.sidecar_reread_spec(&image));
        }
    }

    /// A watched file appeared or changed: create its processing tasks
    /// at LOW priority.
    pub async fn handle_file_changed(self: &Arc<Self>, path: &Path) {
        for spec in self.tasks_for_file(path, Priority::Low).await {
            self.scheduler.submit_task(spec);
        }
    }

    /// A watched file disappeared: drop its record and cache files.
    pub fn handle_file_deleted(self: &Arc<Self>, path: &Path) {
        self.scheduler
            .submit_task(self.db_cleanup_deleted_spec(path));
    }
}

async fn read_head_for_hash(path: &Path) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; CONTENT_HASH_BYTES];
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
