//! One-shot background indexing of the configured watch paths.
//!
//! Job ids use the `daemon_idx::` prefix: no session, progress
//! suppressed, untouched by GUI disconnect handling. Each watch path is
//! walked exactly once at startup; the filesystem watcher owns all
//! changes after that.

use std::path::PathBuf;
use std::sync::Arc;

use lightbox_protocol::Priority;
use tracing::{info, warn};

use crate::scheduler::{DAEMON_INDEX_PREFIX, SourceJob, TaskScheduler};

use super::{DirectoryScanner, PipelineOrchestrator};

pub struct BackgroundIndexer {
    scheduler: Arc<TaskScheduler>,
    pipeline: Arc<PipelineOrchestrator>,
    scanner: DirectoryScanner,
    watch_paths: Vec<PathBuf>,
}

impl BackgroundIndexer {
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        pipeline: Arc<PipelineOrchestrator>,
        scanner: DirectoryScanner,
        watch_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            scheduler,
            pipeline,
            scanner,
            watch_paths,
        }
    }

    /// Submit one indexing job per watch path. Job dedup makes a second
    /// call a no-op.
    pub fn start_indexing(&self) {
        for path in &self.watch_paths {
            if !path.exists() {
                warn!(path = %path.display(), "skipping non-existent watch path");
                continue;
            }
            let job = SourceJob::new(
                format!("{DAEMON_INDEX_PREFIX}{}", path.display()),
                Priority::BackgroundScan,
                self.scanner.batches(path.clone(), true),
            )
            .with_task_factory(self.pipeline.all_tasks_factory());
            self.scheduler.submit_source_job(job);
            info!(path = %path.display(), "submitted background indexing job");
        }
    }
}

impl std::fmt::Debug for BackgroundIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundIndexer")
            .field("watch_paths", &self.watch_paths)
            .finish()
    }
}
