//! Notification fan-out: one bus task drains the bounded queue and
//! writes each surviving notification to every registered listener.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lightbox_core::ActiveSession;
use lightbox_protocol::{Frame, Notification, write_frame};
use parking_lot::Mutex;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type ListenerHandle = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Registered notifier connections (their write halves).
#[derive(Default)]
pub struct Listeners {
    inner: Mutex<HashMap<u64, ListenerHandle>>,
    next_id: AtomicU64,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, writer: OwnedWriteHalf) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .insert(id, Arc::new(tokio::sync::Mutex::new(writer)));
        info!(listener = id, "notification listener registered");
        id
    }

    pub fn remove(&self, id: u64) {
        if self.inner.lock().remove(&id).is_some() {
            info!(listener = id, "notification listener unregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Write a frame to every listener; listeners whose socket broke are
    /// dropped from the set.
    pub async fn broadcast(&self, frame: &Frame) {
        // Snapshot under the lock, write outside it.
        let snapshot: Vec<(u64, ListenerHandle)> = self
            .inner
            .lock()
            .iter()
            .map(|(id, handle)| (*id, Arc::clone(handle)))
            .collect();
        if snapshot.is_empty() {
            debug!("no listeners registered; dropping notification");
            return;
        }
        let mut dead = Vec::new();
        for (id, handle) in snapshot {
            let mut writer = handle.lock().await;
            if let Err(err) = write_frame(&mut *writer, frame).await {
                warn!(listener = id, error = %err, "failed to write notification; removing listener");
                dead.push(id);
            }
        }
        for id in dead {
            self.remove(id);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("count", &self.len()).finish()
    }
}

/// Drain the notification queue: filter stale sessions, frame, fan out.
pub fn spawn_bus(
    mut queue: mpsc::Receiver<Notification>,
    listeners: Arc<Listeners>,
    active_session: ActiveSession,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("notification bus started");
        while let Some(notification) = queue.recv().await {
            // Session-tagged notifications from a superseded view never
            // reach listeners; session-less ones always pass.
            if let Some(session) = &notification.session_id
                && !active_session.matches(session)
            {
                debug!(session = %session, kind = ?notification.kind, "dropping stale notification");
                continue;
            }
            match Frame::json(&notification) {
                Ok(frame) => listeners.broadcast(&frame).await,
                Err(err) => warn!(error = %err, "could not encode notification"),
            }
        }
        info!("notification bus stopped");
    })
}
