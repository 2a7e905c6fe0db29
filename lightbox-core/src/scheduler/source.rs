//! Source jobs: lazy file-enumerating producers run as chains of
//! cooperative slice tasks.
//!
//! A source job never runs to completion inside a worker. Each slice pulls
//! one batch from the producer stream, emits progress, optionally creates
//! tasks for the batch, and schedules the next slice at the job's current
//! priority — so demotion takes effect between slices and cancellation
//! ends the chain naturally.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::Stream;
use lightbox_protocol::{ImageEntry, Notification, Priority};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::task::{OnComplete, TaskOutput, TaskSpec, task_fn};
use super::{TaskScheduler, TaskId};
use crate::error::Result;

/// Jobs with this prefix are daemon-side indexing: no session, progress
/// suppressed, never demoted or cancelled on GUI disconnect.
pub const DAEMON_INDEX_PREFIX: &str = "daemon_idx::";

/// Post-scan task-creation jobs suppress progress notifications; the GUI
/// already knows these files.
pub const POST_SCAN_PREFIX: &str = "post_scan::";

/// Job-id prefixes that belong to a GUI session and are demoted (not
/// cancelled) when that session's client disconnects. Covers both
/// discovery producers and the Stage-C view-image job, so abandoned
/// sessions stop burning workers on full-resolution decodes.
pub const GUI_JOB_PREFIXES: [&str; 3] = ["gui_scan", "post_scan", "gui_view_images"];

/// The lazy sequence a source job consumes, one batch per slice.
pub type BatchStream = Pin<Box<dyn Stream<Item = Vec<PathBuf>> + Send>>;

/// Builds the tasks for one discovered file at the given priority.
pub type TaskFactory =
    Arc<dyn Fn(PathBuf, Priority) -> BoxFuture<'static, Vec<TaskSpec>> + Send + Sync>;

/// A streaming producer wrapped as a cooperative chain of slice tasks.
pub struct SourceJob {
    pub id: String,
    pub priority: Priority,
    pub batches: BatchStream,
    pub task_factory: Option<TaskFactory>,
    /// When false, only notifications are produced for discovered files.
    pub create_tasks: bool,
    /// Overrides the priority handed to the task factory; slices still run
    /// at the job priority.
    pub task_priority: Option<Priority>,
    pub on_complete: Option<OnComplete>,
}

impl SourceJob {
    pub fn new(id: impl Into<String>, priority: Priority, batches: BatchStream) -> Self {
        Self {
            id: id.into(),
            priority,
            batches,
            task_factory: None,
            create_tasks: true,
            task_priority: None,
            on_complete: None,
        }
    }

    pub fn with_task_factory(mut self, factory: TaskFactory) -> Self {
        self.task_factory = Some(factory);
        self
    }

    /// Discovery-only: emit notifications, create no tasks.
    pub fn notifications_only(mut self) -> Self {
        self.create_tasks = false;
        self
    }

    pub fn with_task_priority(mut self, priority: Priority) -> Self {
        self.task_priority = Some(priority);
        self
    }

    pub fn with_on_complete(mut self, hook: OnComplete) -> Self {
        self.on_complete = Some(hook);
        self
    }
}

impl std::fmt::Debug for SourceJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceJob")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("create_tasks", &self.create_tasks)
            .finish_non_exhaustive()
    }
}

/// Registry-resident state of an active job.
pub(crate) struct SourceJobHandle {
    pub id: String,
    pub priority: Mutex<Priority>,
    pub cancelled: CancellationToken,
    pub batches: tokio::sync::Mutex<BatchStream>,
    pub factory: Option<TaskFactory>,
    pub create_tasks: bool,
    pub task_priority: Option<Priority>,
    pub on_complete: Option<OnComplete>,
    /// Slice index parked when the cache was full; resumed after eviction.
    pub deferred_slice: Mutex<Option<u64>>,
}

/// Split `<kind>::<session>::<path>` job ids into their session and path
/// parts. Two-part ids have no session.
pub fn job_session_and_path(job_id: &str) -> (Option<&str>, &str) {
    let parts: Vec<&str> = job_id.splitn(3, "::").collect();
    match parts.as_slice() {
        [_, session, path] => (Some(session), path),
        [_, path] => (None, path),
        _ => (None, job_id),
    }
}

impl TaskScheduler {
    /// Register and start a source job. Submitting an id that is already
    /// active is a no-op.
    pub fn submit_source_job(self: &Arc<Self>, job: SourceJob) {
        info!(job_id = %job.id, priority = %job.priority, "submitting source job");
        let handle = Arc::new(SourceJobHandle {
            id: job.id,
            priority: Mutex::new(job.priority),
            cancelled: CancellationToken::new(),
            batches: tokio::sync::Mutex::new(job.batches),
            factory: job.task_factory,
            create_tasks: job.create_tasks,
            task_priority: job.task_priority,
            on_complete: job.on_complete,
            deferred_slice: Mutex::new(None),
        });
        {
            let mut jobs = self.jobs.lock();
            if jobs.contains_key(&handle.id) {
                warn!(job_id = %handle.id, "source job already active; ignoring submission");
                return;
            }
            jobs.insert(handle.id.clone(), Arc::clone(&handle));
        }
        self.submit_job_slice(&handle, 0);
    }

    pub fn active_job_ids(&self) -> Vec<String> {
        self.jobs.lock().keys().cloned().collect()
    }

    /// Current priority of an active job, if it is still registered.
    pub fn job_priority(&self, job_id: &str) -> Option<Priority> {
        self.jobs.lock().get(job_id).map(|handle| *handle.priority.lock())
    }

    /// Cancel a source job: no further slices run, the registry entry is
    /// removed exactly once.
    pub fn cancel_job(&self, job_id: &str) {
        let handle = self.jobs.lock().remove(job_id);
        match handle {
            Some(handle) => {
                handle.cancelled.cancel();
                info!(job_id, "source job cancelled");
            }
            None => warn!(job_id, "source job not found for cancellation"),
        }
    }

    /// Lower a running job's priority; subsequent slices are scheduled at
    /// the new level. The job keeps running — discovered files still reach
    /// the store. Jobs already at or below the target are left alone.
    pub fn demote_job(&self, job_id: &str, priority: Priority) {
        if let Some(handle) = self.jobs.lock().get(job_id) {
            let mut current = handle.priority.lock();
            if *current <= priority {
                debug!(job_id, current = %*current, "job already at or below demotion target");
                return;
            }
            *current = priority;
            info!(job_id, priority = %priority, "source job demoted");
        }
    }

    /// Resume jobs parked by cache pressure, re-submitting their next
    /// slice at the job's current priority.
    pub fn resume_deferred_jobs(self: &Arc<Self>) {
        let deferred: Vec<(Arc<SourceJobHandle>, u64)> = self
            .jobs
            .lock()
            .values()
            .filter_map(|handle| {
                handle
                    .deferred_slice
                    .lock()
                    .take()
                    .map(|index| (Arc::clone(handle), index))
            })
            .collect();
        for (handle, index) in deferred {
            debug!(job_id = %handle.id, slice = index, "resuming deferred source job");
            self.submit_job_slice(&handle, index);
        }
    }

    fn submit_job_slice(
        self: &Arc<Self>,
        handle: &Arc<SourceJobHandle>,
        index: u64,
    ) -> bool {
        let slice_id: TaskId = format!("job_slice::{}::{}", handle.id, index);
        let priority = *handle.priority.lock();
        let scheduler = Arc::downgrade(self);
        let handle = Arc::clone(handle);
        let func = task_fn(move |_ctx| {
            let scheduler = scheduler.clone();
            let handle = Arc::clone(&handle);
            async move {
                match scheduler.upgrade() {
                    Some(scheduler) => scheduler.run_job_slice(handle, index).await,
                    None => Ok(TaskOutput::None),
                }
            }
        });
        self.submit_task(TaskSpec::new(slice_id, priority, func))
            .accepted()
    }

    async fn run_job_slice(
        self: Arc<Self>,
        handle: Arc<SourceJobHandle>,
        index: u64,
    ) -> Result<TaskOutput> {
        if handle.cancelled.is_cancelled() {
            debug!(job_id = %handle.id, slice = index, "skipping slice of cancelled job");
            return Ok(TaskOutput::None);
        }

        // Low-priority producers pause while the cache is over its limit;
        // the chain is parked, not rescheduled, and resumes after an
        // eviction frees space. Higher-priority jobs are never gated.
        let priority = *handle.priority.lock();
        if priority.is_background() && self.cache_full() {
            debug!(job_id = %handle.id, slice = index, "cache full; deferring source job");
            *handle.deferred_slice.lock() = Some(index);
            return Ok(TaskOutput::None);
        }

        let batch = handle.batches.lock().await.next().await;
        let Some(batch) = batch else {
            info!(job_id = %handle.id, slice = index, "source job exhausted");
            self.jobs.lock().remove(&handle.id);
            // scan_complete goes out before on_complete so the GUI sees the
            // completion before any previews_ready created by the hook.
            self.emit_scan_complete(&handle, index);
            if let Some(hook) = &handle.on_complete {
                let hook = Arc::clone(hook);
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook())).is_err() {
                    error!(job_id = %handle.id, "source job on_complete hook panicked");
                }
            }
            return Ok(TaskOutput::None);
        };

        let is_daemon_job = handle.id.starts_with(DAEMON_INDEX_PREFIX);
        let (session, job_path) = job_session_and_path(&handle.id);
        let session = if is_daemon_job { None } else { session };
        let suppress_progress = is_daemon_job || handle.id.starts_with(POST_SCAN_PREFIX);

        if !suppress_progress {
            let entries: Vec<ImageEntry> = batch
                .iter()
                .map(|p| ImageEntry::new(p.to_string_lossy()))
                .collect();
            self.notifications.send(Notification::scan_progress(
                job_path,
                entries,
                session.map(str::to_string),
            ));
        }

        if handle.create_tasks
            && let Some(factory) = &handle.factory
        {
            let effective = handle.task_priority.unwrap_or(priority);
            for path in &batch {
                for spec in factory(path.clone(), effective).await {
                    self.submit_task(spec);
                }
            }
        }

        let next = index + 1;
        if !self.submit_job_slice(&handle, next) {
            error!(job_id = %handle.id, "failed to schedule next slice; emitting scan_complete");
            self.jobs.lock().remove(&handle.id);
            self.emit_scan_complete(&handle, index);
        }
        Ok(TaskOutput::None)
    }

    fn emit_scan_complete(&self, handle: &SourceJobHandle, slice_index: u64) {
        if !handle.id.contains("gui_scan") {
            return;
        }
        let (session, job_path) = job_session_and_path(&handle.id);
        self.notifications.send(Notification::scan_complete(
            job_path,
            slice_index as usize,
            session.map(str::to_string),
        ));
    }
}
