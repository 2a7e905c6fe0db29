//! Live filesystem watching of the configured library paths.
//!
//! The watcher is exclusively a live-event monitor; initial indexing is
//! the background indexer's job. Self-inflicted sidecar writes are
//! suppressed via an ignore window: atomic replace produces several
//! events (delete, then rename/create), so a single-event flag is not
//! enough.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::pipeline::PipelineOrchestrator;
use crate::util::dotted_extension;

/// How long events for an announced path stay suppressed.
const IGNORE_WINDOW: Duration = Duration::from_secs(2);

/// Coordination point between the sidecar write path and the watcher.
#[derive(Default)]
pub struct WatchGuard {
    ignore_until: Mutex<HashMap<PathBuf, Instant>>,
}

impl WatchGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce an imminent self-inflicted write to `path`.
    pub fn ignore_for_window(&self, path: PathBuf) {
        debug!(path = %path.display(), "suppressing watcher events for write window");
        self.ignore_until
            .lock()
            .insert(path, Instant::now() + IGNORE_WINDOW);
    }

    /// Whether events for `path` are currently suppressed. Expired
    /// entries are dropped on the way out.
    pub fn should_ignore(&self, path: &Path) -> bool {
        let mut guard = self.ignore_until.lock();
        match guard.get(path) {
            Some(deadline) if Instant::now() < *deadline => true,
            Some(_) => {
                guard.remove(path);
                false
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchGuard")
            .field("suppressed", &self.ignore_until.lock().len())
            .finish()
    }
}

/// Owns the notify backend and the event-dispatch task.
pub struct LibraryWatcher {
    _watcher: notify::RecommendedWatcher,
    dispatch: tokio::task::JoinHandle<()>,
}

impl LibraryWatcher {
    /// Watch `paths` recursively and route events into the pipeline.
    pub fn spawn(pipeline: Arc<PipelineOrchestrator>, paths: &[PathBuf]) -> Result<Self> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            // The callback runs on notify's own thread; an unbounded send
            // never blocks it.
            let _ = tx.send(result);
        })
        .map_err(|err| CoreError::Internal(format!("watcher init: {err}")))?;

        let mut watched = 0usize;
        for path in paths {
            if !path.exists() {
                warn!(path = %path.display(), "watch path does not exist");
                continue;
            }
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(|err| CoreError::Internal(format!("watch {}: {err}", path.display())))?;
            info!(path = %path.display(), "watching for changes");
            watched += 1;
        }
        if watched == 0 {
            info!("no watch paths configured; watcher idle");
        }

        let dispatch = tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(event) => dispatch_event(&pipeline, event).await,
                    Err(err) => warn!(error = %err, "filesystem watch error"),
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            dispatch,
        })
    }

    pub fn stop(self) {
        self.dispatch.abort();
        info!("filesystem watcher stopped");
    }
}

impl std::fmt::Debug for LibraryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryWatcher").finish_non_exhaustive()
    }
}

async fn dispatch_event(pipeline: &Arc<PipelineOrchestrator>, event: Event) {
    let removed = matches!(event.kind, EventKind::Remove(_));
    if !removed && !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }
    for path in event.paths {
        if pipeline.watch_guard().should_ignore(&path) {
            debug!(path = %path.display(), "ignoring self-inflicted event");
            continue;
        }

        // Sidecar events re-extract metadata for their image; sidecar
        // deletions are ignored.
        if dotted_extension(&path).as_deref() == Some(".xmp") {
            if !removed {
                pipeline.handle_sidecar_changed(&path);
            }
            continue;
        }

        if removed {
            debug!(path = %path.display(), "watched file removed");
            pipeline.handle_file_deleted(&path);
        } else {
            debug!(path = %path.display(), "watched file created or modified");
            pipeline.handle_file_changed(&path).await;
        }
    }
}
