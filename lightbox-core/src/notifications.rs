//! Bounded notification queue between workers and the daemon's fan-out bus.

use std::time::Duration;

use lightbox_protocol::Notification;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default queue depth; deep enough for burst scans, bounded so a stalled
/// listener cannot grow memory without limit.
pub const NOTIFICATION_QUEUE_DEPTH: usize = 5000;

/// Producer half handed to the scheduler, pipeline and watcher.
///
/// Sends never block a worker: a full queue drops the notification and
/// logs a warning.
#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::Sender<Notification>,
}

impl NotificationSender {
    /// Create the queue, returning the producer and the drain half.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    /// Non-blocking send; drops with a warning when the queue is full.
    pub fn send(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(n)) => {
                warn!(kind = ?n.kind, "notification queue full; dropping");
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                debug!(kind = ?n.kind, "notification bus closed; dropping");
            }
        }
    }

    /// Send with a bounded wait, used by the dedicated fast-scan producer
    /// which may briefly outpace the bus.
    pub async fn send_timeout(&self, notification: Notification, timeout: Duration) {
        if let Err(err) = self.tx.send_timeout(notification, timeout).await {
            match err {
                mpsc::error::SendTimeoutError::Timeout(n) => {
                    warn!(kind = ?n.kind, "notification queue full; dropping after wait");
                }
                mpsc::error::SendTimeoutError::Closed(n) => {
                    debug!(kind = ?n.kind, "notification bus closed; dropping");
                }
            }
        }
    }
}

impl std::fmt::Debug for NotificationSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationSender").finish_non_exhaustive()
    }
}
