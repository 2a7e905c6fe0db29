//! The runnable-task priority queue.
//!
//! Holds only tasks with no unmet dependencies. Ordering is strict
//! `(priority desc, seq asc)`: FIFO within a priority level. The queue has
//! its own lock; callers must never hold the graph lock while pushing.

use std::collections::BinaryHeap;
use std::time::Duration;

use lightbox_protocol::Priority;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::task::TaskId;

/// A queued reference to a graph task. `epoch` detects entries invalidated
/// after they were pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub priority: Priority,
    pub seq: u64,
    pub id: TaskId,
    pub epoch: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority wins; within a level the lower seq
        // (earlier submission) must come out first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<QueueEntry>,
    /// Entries pushed but not yet acknowledged via `task_done`. Includes
    /// both heap residents and dequeued in-flight items, so `join` only
    /// returns when every dequeued entry was fully processed.
    unfinished: usize,
}

pub(crate) struct TaskQueue {
    inner: Mutex<Inner>,
    pushed: Notify,
    drained: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                unfinished: 0,
            }),
            pushed: Notify::new(),
            drained: Notify::new(),
        }
    }

    pub fn push(&self, entry: QueueEntry) {
        {
            let mut inner = self.inner.lock();
            inner.heap.push(entry);
            inner.unfinished += 1;
        }
        self.pushed.notify_one();
    }

    /// Pop the highest-priority entry, waiting up to `timeout`. Every
    /// `Some` return must be matched by exactly one `task_done`.
    pub async fn pop(&self, timeout: Duration) -> Option<QueueEntry> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            if let Some(entry) = self.inner.lock().heap.pop() {
                return Some(entry);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Non-blocking pop used by the shutdown drain.
    pub fn try_pop(&self) -> Option<QueueEntry> {
        self.inner.lock().heap.pop()
    }

    /// Acknowledge a popped entry (run, discarded or drained).
    pub fn task_done(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.unfinished > 0, "task_done without matching pop");
        inner.unfinished = inner.unfinished.saturating_sub(1);
        if inner.unfinished == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Wait until every pushed entry has been acknowledged.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            if self.inner.lock().unfinished == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }
}
