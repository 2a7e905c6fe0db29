//! Framed request/response server on the Unix-domain socket.
//!
//! Each accepted connection gets its own task. A connection either
//! upgrades itself into the notification fan-out set with a
//! `register_notifier` handshake, or speaks framed request/response
//! until it closes. Validation errors answer with `status=error` and
//! keep the connection; framing and oversize errors close it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lightbox_core::pipeline::{DirectoryScanner, PipelineOrchestrator};
use lightbox_core::scheduler::{GUI_JOB_PREFIXES, SourceJob, TaskScheduler};
use lightbox_core::store::MetadataStore;
use lightbox_core::{ActiveSession, Priority};
use lightbox_protocol::{
    Frame, FrameError, Notification, PreviewStatus, Reply, ReplyBody, Request, TagQueryReply,
    read_frame, write_frame,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::OwnedReadHalf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::Listeners;

/// Bounded wait when the fast-scan producer pushes into a full queue.
const FAST_SCAN_SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub struct DaemonServer {
    scheduler: Arc<TaskScheduler>,
    pipeline: Arc<PipelineOrchestrator>,
    store: Arc<MetadataStore>,
    scanner: DirectoryScanner,
    listeners: Arc<Listeners>,
    active_session: ActiveSession,
    notifications: lightbox_core::notifications::NotificationSender,
    fast_scan_cancel: Mutex<Option<CancellationToken>>,
    /// Cancelled when a `shutdown` command arrives; main tears the
    /// process down.
    shutdown: CancellationToken,
}

impl DaemonServer {
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        pipeline: Arc<PipelineOrchestrator>,
        store: Arc<MetadataStore>,
        scanner: DirectoryScanner,
        listeners: Arc<Listeners>,
        active_session: ActiveSession,
        notifications: lightbox_core::notifications::NotificationSender,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            pipeline,
            store,
            scanner,
            listeners,
            active_session,
            notifications,
            fast_scan_cancel: Mutex::new(None),
            shutdown,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until the shutdown token fires.
    pub async fn run(self: Arc<Self>, listener: UnixListener) {
        info!("accepting connections");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.handle_connection(stream).await;
                        });
                    }
                    Err(err) => {
                        if self.shutdown.is_cancelled() {
                            break;
                        }
                        error!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        info!("server stopped accepting connections");
    }

    async fn handle_connection(self: &Arc<Self>, stream: UnixStream) {
        let (mut reader, mut writer) = stream.into_split();
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err @ (FrameError::Oversize { .. } | FrameError::Truncated { .. })) => {
                    warn!(error = %err, "closing connection on framing error");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "closing connection on protocol error");
                    break;
                }
            };

            let Frame::Json(body) = frame else {
                let reply = Reply::error("binary frames are not valid requests");
                if self.write_reply(&mut writer, &reply).await.is_err() {
                    break;
                }
                continue;
            };

            // The handshake is not a command; peek before full parsing.
            if is_register_notifier(&body) {
                let id = self.listeners.add(writer);
                self.wait_for_notifier_close(reader).await;
                self.listeners.remove(id);
                self.handle_notifier_disconnect();
                return;
            }

            let reply = match serde_json::from_slice::<Request>(&body) {
                Ok(request) => {
                    debug!(command = ?request, "dispatching request");
                    self.dispatch(request).await
                }
                Err(err) => Reply::error(format!("validation error: {err}")),
            };
            if self.write_reply(&mut writer, &reply).await.is_err() {
                break;
            }
        }
    }

    async fn write_reply(
        &self,
        writer: &mut (impl tokio::io::AsyncWrite + Unpin),
        reply: &Reply,
    ) -> Result<(), FrameError> {
        let frame = Frame::json(reply)?;
        write_frame(writer, &frame).await
    }

    /// A registered notifier never sends again; block on its read half
    /// until the peer closes.
    async fn wait_for_notifier_close(&self, mut reader: OwnedReadHalf) {
        let mut sink = [0u8; 1024];
        loop {
            match reader.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }

    /// GUI disconnect: demote that session's discovery and view-image
    /// jobs to ORPHAN_SCAN — discovered files still reach the store,
    /// just at background urgency — and clear the active session.
    /// Daemon indexing and watcher jobs are untouched.
    fn handle_notifier_disconnect(&self) {
        let Some(session) = self.active_session.get() else {
            return;
        };
        for job_id in self.scheduler.active_job_ids() {
            if GUI_JOB_PREFIXES
                .iter()
                .any(|prefix| job_id.starts_with(prefix))
                && job_id.contains(&session)
            {
                info!(job_id = %job_id, "client disconnected; demoting session job");
                self.scheduler.demote_job(&job_id, Priority::OrphanScan);
            }
        }
        self.active_session.clear_if(&session);
    }

    async fn dispatch(self: &Arc<Self>, request: Request) -> Reply {
        match request {
            Request::GetDirectoryFiles {
                session_id,
                path,
                recursive,
            } => self.get_directory_files(session_id, path, recursive).await,

            Request::RequestPreviews {
                image_paths,
                priority,
                ..
            } => {
                let session = self.active_session.get();
                let count = self
                    .pipeline
                    .batch_request_thumbnails(&image_paths, priority, session.as_deref())
                    .await;
                Reply::ok(ReplyBody::Count { count })
            }

            Request::UpdateViewport {
                paths_to_upgrade,
                paths_to_downgrade,
                ..
            } => {
                let session = self.active_session.get();
                let count = self
                    .pipeline
                    .batch_request_thumbnails(
                        &paths_to_upgrade,
                        Priority::GuiRequest,
                        session.as_deref(),
                    )
                    .await;
                if !paths_to_downgrade.is_empty() {
                    self.pipeline
                        .downgrade_thumbnail_tasks(&paths_to_downgrade, Priority::GuiRequestLow);
                }
                Reply::ok(ReplyBody::Count { count })
            }

            Request::RequestViewImage { image_path, .. } => {
                let session = self.active_session.get();
                let view_image_path = self
                    .pipeline
                    .request_view_image(&image_path, session.as_deref())
                    .await;
                Reply::ok(ReplyBody::ViewImage { view_image_path })
            }

            Request::GetPreviewsStatus { image_paths, .. } => {
                self.get_previews_status(image_paths).await
            }

            Request::SetRating {
                image_paths,
                rating,
                ..
            } => self.set_rating(image_paths, rating).await,

            Request::GetMetadataBatch {
                image_paths,
                priority,
                ..
            } => {
                if let Some(priority) = priority {
                    self.pipeline
                        .request_metadata_extraction(&image_paths, priority)
                        .await;
                }
                let mut metadata = HashMap::with_capacity(image_paths.len());
                for path in image_paths {
                    let record = self.store.get(&path).await.unwrap_or(None);
                    metadata.insert(path, record);
                }
                Reply::ok(ReplyBody::MetadataBatch { metadata })
            }

            Request::GetFilteredFilePaths {
                text_filter,
                star_states,
                tag_names,
                ..
            } => match self
                .store
                .get_filtered_file_paths(&text_filter, &star_states, tag_names.as_deref())
                .await
            {
                Ok(paths) => {
                    let mut paths: Vec<String> = paths.into_iter().collect();
                    paths.sort();
                    Reply::ok(ReplyBody::FilteredPaths { paths })
                }
                Err(err) => Reply::error(format!("filter query failed: {err}")),
            },

            Request::SetTags {
                image_paths, tags, ..
            } => self.set_tags(image_paths, tags).await,

            Request::RemoveTags {
                image_paths, tags, ..
            } => self.remove_tags(image_paths, tags).await,

            Request::GetTags { directory, .. } => {
                let directory_tags = match &directory {
                    Some(dir) => self.store.get_directory_tags(dir).await.unwrap_or_default(),
                    None => Vec::new(),
                };
                match self.store.get_all_tags(None).await {
                    Ok(global_tags) => Reply::ok(ReplyBody::Tags(TagQueryReply {
                        directory_tags,
                        global_tags,
                    })),
                    Err(err) => Reply::error(format!("tag query failed: {err}")),
                }
            }

            Request::GetImageTags { image_paths, .. } => {
                match self.store.get_image_tags_batch(&image_paths).await {
                    Ok(tags) => Reply::ok(ReplyBody::ImageTags { tags }),
                    Err(err) => Reply::error(format!("tag query failed: {err}")),
                }
            }

            Request::MoveRecords { moves, .. } => {
                let pairs: Vec<(String, String)> = moves
                    .into_iter()
                    .map(|m| (m.old_path, m.new_path))
                    .collect();
                match self.store.move_records(&pairs).await {
                    Ok(moved_count) => Reply::ok(ReplyBody::MovedCount { moved_count }),
                    Err(err) => Reply::error(format!("move failed: {err}")),
                }
            }

            Request::Shutdown { .. } => {
                info!("shutdown requested over the wire");
                self.shutdown.cancel();
                Reply::ok_message("Server shutting down")
            }
        }
    }

    /// A new directory load defines the active session, starts the
    /// discovery producers, and answers immediately with whatever the
    /// store already knows.
    async fn get_directory_files(
        self: &Arc<Self>,
        session_id: Option<String>,
        path: String,
        recursive: bool,
    ) -> Reply {
        let Some(session) = session_id.filter(|s| !s.is_empty()) else {
            return Reply::error("get_directory_files requires a non-empty session_id");
        };
        self.active_session.set(session.clone());
        info!(session = %session, path = %path, "active GUI session set");

        // Producer 1 (fast scan): a dedicated task outside the worker
        // pool streams discovery batches straight to the notification
        // queue, superseding any previous load's producer.
        let cancel = CancellationToken::new();
        if let Some(previous) = self.fast_scan_cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        {
            let server = Arc::clone(self);
            let session = session.clone();
            let scan_path = path.clone();
            tokio::spawn(async move {
                server
                    .run_fast_scan(session, scan_path, recursive, cancel)
                    .await;
            });
        }

        // Producer 2: the slow task-creating scan at GUI_REQUEST_LOW.
        self.scheduler.submit_source_job(
            SourceJob::new(
                format!("gui_scan_tasks::{session}::{path}"),
                Priority::GuiRequestLow,
                self.scanner.batches(path.clone().into(), recursive),
            )
            .with_task_factory(self.pipeline.standard_task_factory()),
        );

        // Producer 3 (Stage C): view images at BACKGROUND_SCAN, consuming
        // workers only once the thumbnail queue is drained.
        self.scheduler.submit_source_job(
            SourceJob::new(
                format!("gui_view_images::{session}::{path}"),
                Priority::BackgroundScan,
                self.scanner.batches(path.clone().into(), recursive),
            )
            .with_task_factory(self.pipeline.view_image_task_factory()),
        );

        match self.store.get_directory_files(&path, recursive).await {
            Ok(mut files) => {
                files.sort();
                if !files.is_empty() {
                    info!(count = files.len(), path = %path, "returning cached listing while scan runs");
                }
                Reply::ok(ReplyBody::DirectoryFiles { files })
            }
            Err(err) => Reply::error(format!("listing failed: {err}")),
        }
    }

    async fn run_fast_scan(
        self: Arc<Self>,
        session: String,
        path: String,
        recursive: bool,
        cancel: CancellationToken,
    ) {
        let mut stream = self.scanner.batches(path.clone().into(), recursive);
        while let Some(batch) = stream.next().await {
            if cancel.is_cancelled() || !self.active_session.matches(&session) {
                debug!(session = %session, "fast scan superseded");
                return;
            }
            let entries = batch
                .iter()
                .map(|p| lightbox_protocol::ImageEntry::new(p.to_string_lossy()))
                .collect();
            self.notifications
                .send_timeout(
                    Notification::scan_progress(&path, entries, Some(session.clone())),
                    FAST_SCAN_SEND_TIMEOUT,
                )
                .await;
        }
        info!(path = %path, "fast scan complete");
    }

    async fn get_previews_status(&self, image_paths: Vec<String>) -> Reply {
        let mut statuses = HashMap::with_capacity(image_paths.len());
        for path in image_paths {
            let mut status = PreviewStatus::default();
            if let Ok(Some(cached)) = self.store.preview_paths(&path).await {
                if let Some(thumb) = cached.thumbnail_path
                    && tokio::fs::try_exists(&thumb).await.unwrap_or(false)
                {
                    status.thumbnail_ready = true;
                    status.thumbnail_path = Some(thumb);
                }
                if let Some(view) = cached.view_image_path
                    && tokio::fs::try_exists(&view).await.unwrap_or(false)
                {
                    status.view_image_ready = true;
                    status.view_image_path = Some(view);
                }
            }
            statuses.insert(path, status);
        }
        Reply::ok(ReplyBody::PreviewsStatus { statuses })
    }

    async fn set_rating(&self, image_paths: Vec<String>, rating: i64) -> Reply {
        match self.store.batch_set_ratings(&image_paths, rating).await {
            Ok((_, _written)) => {
                for path in &image_paths {
                    self.pipeline
                        .queue_rating_write(path, rating as u8, Priority::Normal);
                }
                Reply::ok_message("Ratings updated and queued for sidecar write")
            }
            Err(err) => Reply::error(format!("failed to update rating: {err}")),
        }
    }

    async fn set_tags(&self, image_paths: Vec<String>, tags: Vec<String>) -> Reply {
        if let Err(err) = self.store.batch_ensure_records_exist(&image_paths).await {
            return Reply::error(format!("failed to ensure records: {err}"));
        }
        match self.store.batch_set_tags(&image_paths, &tags).await {
            Ok(_) => {
                for path in &image_paths {
                    self.pipeline
                        .queue_tags_write(path, tags.clone(), Priority::Normal);
                }
                Reply::ok_message("Tags updated and queued for sidecar write")
            }
            Err(err) => Reply::error(format!("failed to set tags: {err}")),
        }
    }

    async fn remove_tags(&self, image_paths: Vec<String>, tags: Vec<String>) -> Reply {
        for path in &image_paths {
            if let Err(err) = self.store.remove_image_tags(path, &tags).await {
                debug!(path = %path, error = %err, "remove_tags skipped a path");
                continue;
            }
            // Sidecar carries the surviving set: replace semantics.
            let remaining = self.store.get_image_tags(path).await.unwrap_or_default();
            self.pipeline
                .queue_tags_write(path, remaining, Priority::Normal);
        }
        Reply::ok_message("Tags removed")
    }
}

impl std::fmt::Debug for DaemonServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonServer")
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

fn is_register_notifier(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("type")
                .and_then(|t| t.as_str())
                .map(|t| t == lightbox_protocol::REGISTER_NOTIFIER)
        })
        .unwrap_or(false)
}
