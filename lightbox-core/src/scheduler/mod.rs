//! Priority task scheduler: dependency graph, worker pool, dedup/upgrade,
//! cooperative cancellation and two-phase shutdown.
//!
//! The graph is the single source of truth. The queue holds `(id, epoch)`
//! references to runnable tasks only; invalidating a queued task (upgrade,
//! downgrade, cancel) bumps its epoch so the stale entry is discarded when
//! a worker dequeues it. Structural edits happen under the graph lock;
//! queue pushes always happen after it is released.

mod queue;
mod source;
mod task;

pub use source::{
    BatchStream, DAEMON_INDEX_PREFIX, GUI_JOB_PREFIXES, POST_SCAN_PREFIX,
    SourceJob, TaskFactory, job_session_and_path,
};
pub use task::{
    OnComplete, SubmitOutcome, TaskCallback, TaskContext, TaskFn, TaskId,
    TaskOutput, TaskSpec, TaskState, task_fn,
};

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use lightbox_protocol::Priority;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::CoreError;
use crate::notifications::NotificationSender;
use queue::{QueueEntry, TaskQueue};
use source::SourceJobHandle;
use task::{StoredResult, Task};

/// Queue entry id that tells a worker to exit.
const SHUTDOWN_SENTINEL: &str = "__shutdown_sentinel__";

/// Worker pop timeout; short so shutdown sentinels are observed promptly.
const POP_TIMEOUT: Duration = Duration::from_millis(200);

type CacheGate = Arc<dyn Fn() -> bool + Send + Sync>;

/// The scheduler. Construct with [`TaskScheduler::new`], wrap in an `Arc`
/// and call [`TaskScheduler::start`].
pub struct TaskScheduler {
    workers: usize,
    graph: Mutex<HashMap<TaskId, Task>>,
    queue: TaskQueue,
    callbacks: Mutex<HashMap<TaskId, Vec<TaskCallback>>>,
    active: Mutex<HashMap<usize, TaskId>>,
    jobs: Mutex<HashMap<String, Arc<SourceJobHandle>>>,
    notifications: NotificationSender,
    cache_gate: Mutex<Option<CacheGate>>,
    running: AtomicBool,
    shutting_down: AtomicBool,
    seq: AtomicU64,
    epoch: AtomicU64,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(workers: usize, notifications: NotificationSender) -> Self {
        Self {
            workers,
            graph: Mutex::new(HashMap::new()),
            queue: TaskQueue::new(),
            callbacks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            notifications,
            cache_gate: Mutex::new(None),
            running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            // Epoch 0 is reserved for the shutdown sentinel.
            epoch: AtomicU64::new(1),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(workers = self.workers, "scheduler starting");
        let mut handles = self.worker_handles.lock();
        for worker_id in 0..self.workers {
            let scheduler = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                scheduler.worker_loop(worker_id).await;
            }));
        }
    }

    pub fn notifications(&self) -> &NotificationSender {
        &self.notifications
    }

    /// Install the cache-pressure check used to gate background source
    /// jobs. Set once during startup wiring.
    pub fn set_cache_gate(&self, gate: CacheGate) {
        *self.cache_gate.lock() = Some(gate);
    }

    pub(crate) fn cache_full(&self) -> bool {
        self.cache_gate.lock().as_ref().is_some_and(|gate| gate())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed)
    }

    // ── Submission ──────────────────────────────────────────────────────

    pub fn submit_task(&self, spec: TaskSpec) -> SubmitOutcome {
        self.submit_with_callback(spec, None)
    }

    /// Submit a task, deduplicating by id.
    ///
    /// An existing pending task is replaced when the new priority is
    /// strictly higher (its cancel token and dependents survive), or has
    /// its payload refreshed in place at equal/lower priority so the last
    /// writer wins on parameters. Terminal tasks fire `callback`
    /// immediately; running tasks store it for delivery on completion.
    pub fn submit_with_callback(
        &self,
        spec: TaskSpec,
        callback: Option<TaskCallback>,
    ) -> SubmitOutcome {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!(task_id = %spec.id, "scheduler shutting down, rejecting task");
            return SubmitOutcome::Rejected;
        }

        let task_id = spec.id.clone();
        let mut callback = callback;
        let mut late_callback: Option<(TaskCallback, Option<StoredResult>)> = None;
        let mut to_push: Vec<QueueEntry> = Vec::new();
        let outcome;

        {
            let mut graph = self.graph.lock();
            if let Some(existing) = graph.get_mut(&task_id) {
                if existing.state == TaskState::Running || existing.state.is_terminal() {
                    if spec.priority > existing.priority {
                        warn!(
                            task_id = %task_id,
                            state = ?existing.state,
                            "cannot re-submit finished or running task at higher priority"
                        );
                    } else {
                        debug!(
                            task_id = %task_id,
                            state = ?existing.state,
                            "ignoring re-submission of finished or running task"
                        );
                    }
                    if existing.state.is_terminal() {
                        // Fire after the lock is released; storing it would
                        // silently never deliver. The callback gets the
                        // result the task actually finished with.
                        late_callback = callback
                            .take()
                            .map(|cb| (cb, existing.result.clone()));
                        outcome = SubmitOutcome::AlreadyDone;
                    } else {
                        if let Some(cb) = callback.take() {
                            self.callbacks
                                .lock()
                                .entry(task_id.clone())
                                .or_default()
                                .push(cb);
                        }
                        outcome = SubmitOutcome::AlreadyRunning;
                    }
                } else if spec.priority > existing.priority {
                    info!(
                        task_id = %task_id,
                        from = %existing.priority,
                        to = %spec.priority,
                        "upgrading task priority"
                    );
                    // Invalidate the queued entry (if any) and replace the
                    // payload. Dependents and the original cancel token are
                    // preserved so concurrent cancel_task calls keep
                    // signalling the intended work.
                    existing.epoch = self.next_epoch();
                    existing.priority = spec.priority;
                    existing.func = spec.func;
                    existing.dependencies = spec.dependencies;
                    existing.on_complete = spec.on_complete;
                    existing.state = TaskState::Pending;
                    existing.is_active = true;
                    if existing.session_id.is_none() {
                        existing.session_id = spec.session_id;
                    }
                    outcome = SubmitOutcome::Upgraded;
                } else {
                    // Refresh the payload so the queued task runs with the
                    // latest parameters (e.g. the most recent rating).
                    existing.func = spec.func;
                    debug!(task_id = %task_id, "task pending, updated payload in place");
                    if let Some(cb) = callback.take() {
                        self.callbacks
                            .lock()
                            .entry(task_id.clone())
                            .or_default()
                            .push(cb);
                    }
                    outcome = SubmitOutcome::Updated;
                }
            } else {
                let cancel = spec.cancel.unwrap_or_default();
                let dependencies = spec.dependencies.clone();
                graph.insert(
                    task_id.clone(),
                    Task {
                        id: task_id.clone(),
                        priority: spec.priority,
                        epoch: self.next_epoch(),
                        func: spec.func,
                        state: TaskState::Pending,
                        dependencies: spec.dependencies,
                        dependents: HashSet::new(),
                        is_active: true,
                        cancel,
                        worker_id: None,
                        on_complete: spec.on_complete,
                        session_id: spec.session_id,
                        result: None,
                    },
                );
                for dep_id in &dependencies {
                    if let Some(dep) = graph.get_mut(dep_id) {
                        dep.dependents.insert(task_id.clone());
                    } else {
                        // Application responsibility: dependencies should be
                        // submitted first; the task stays pending until the
                        // dependency appears and completes.
                        warn!(
                            task_id = %task_id,
                            dependency = %dep_id,
                            "task submitted with unknown dependency"
                        );
                    }
                }
                outcome = SubmitOutcome::Submitted;
            }

            if matches!(outcome, SubmitOutcome::Submitted | SubmitOutcome::Upgraded) {
                self.inherit_priority_locked(&mut graph, &task_id, &mut to_push);

                if let Some(task) = graph.get_mut(&task_id)
                    && task.dependencies.is_empty()
                    && task.state == TaskState::Pending
                {
                    task.state = TaskState::Queued;
                    to_push.push(QueueEntry {
                        priority: task.priority,
                        seq: self.next_seq(),
                        id: task_id.clone(),
                        epoch: task.epoch,
                    });
                }
            }
        }

        // Enqueue outside the graph lock to avoid nested-lock contention
        // with the queue's own mutex.
        for entry in to_push {
            self.queue.push(entry);
        }

        if let Some((cb, stored)) = late_callback {
            let replay = stored.unwrap_or(Ok(TaskOutput::None));
            let delivery = std::panic::catch_unwind(AssertUnwindSafe(|| match &replay {
                Ok(output) => cb(&task_id, Ok(output)),
                Err(err) => cb(&task_id, Err(err.as_ref())),
            }));
            if delivery.is_err() {
                error!(task_id = %task_id, "late callback for already-done task panicked");
            }
        }
        if let Some(cb) = callback {
            self.callbacks
                .lock()
                .entry(task_id)
                .or_default()
                .push(cb);
        }
        outcome
    }

    /// Propagate the submitted task's priority down through its
    /// dependencies so a high-priority task is never stuck behind
    /// low-priority prerequisites. Queued dependencies are re-queued at
    /// the raised priority.
    fn inherit_priority_locked(
        &self,
        graph: &mut HashMap<TaskId, Task>,
        root_id: &str,
        to_push: &mut Vec<QueueEntry>,
    ) {
        let Some(root) = graph.get(root_id) else {
            return;
        };
        let target = root.priority;
        let mut pending: VecDeque<TaskId> = root.dependencies.iter().cloned().collect();
        // Visited set guards against cycles; the graph is acyclic by
        // construction so revisits indicate a wiring bug upstream.
        let mut visited: HashSet<TaskId> = pending.iter().cloned().collect();

        while let Some(dep_id) = pending.pop_front() {
            let Some(dep) = graph.get_mut(&dep_id) else {
                continue;
            };
            if dep.priority >= target {
                continue;
            }
            debug!(
                dependency = %dep_id,
                from = %dep.priority,
                to = %target,
                "priority inheritance"
            );
            dep.priority = target;
            if dep.state == TaskState::Queued {
                dep.epoch = self.next_epoch();
                to_push.push(QueueEntry {
                    priority: target,
                    seq: self.next_seq(),
                    id: dep_id.clone(),
                    epoch: dep.epoch,
                });
            }
            let sub_deps: Vec<TaskId> = dep.dependencies.iter().cloned().collect();
            for sub in sub_deps {
                if visited.insert(sub.clone()) {
                    pending.push_back(sub);
                }
            }
        }
    }

    // ── Priority maintenance ────────────────────────────────────────────

    /// Upgrade the given tasks (and, transitively, their lower-priority
    /// dependencies) to `priority`, re-queueing any invalidated entries.
    pub fn update_task_priorities<I>(&self, task_ids: I, priority: Priority)
    where
        I: IntoIterator<Item = TaskId>,
    {
        let mut to_push: Vec<QueueEntry> = Vec::new();
        {
            let mut graph = self.graph.lock();
            let mut bfs: VecDeque<TaskId> = task_ids
                .into_iter()
                .filter(|id| graph.contains_key(id))
                .collect();
            let mut visited: HashSet<TaskId> = bfs.iter().cloned().collect();
            let mut to_upgrade: Vec<TaskId> = Vec::new();

            while let Some(id) = bfs.pop_front() {
                let Some(task) = graph.get(&id) else {
                    continue;
                };
                if task.priority >= priority {
                    continue;
                }
                to_upgrade.push(id.clone());
                for dep in &task.dependencies {
                    if graph.contains_key(dep) && !visited.contains(dep) {
                        visited.insert(dep.clone());
                        bfs.push_back(dep.clone());
                    }
                }
            }

            for id in to_upgrade {
                let Some(task) = graph.get_mut(&id) else {
                    continue;
                };
                if task.state == TaskState::Running || task.state.is_terminal() {
                    continue;
                }
                task.priority = priority;
                task.epoch = self.next_epoch();
                task.is_active = true;
                if task.state == TaskState::Queued {
                    to_push.push(QueueEntry {
                        priority,
                        seq: self.next_seq(),
                        id: id.clone(),
                        epoch: task.epoch,
                    });
                }
            }
        }
        for entry in to_push {
            self.queue.push(entry);
        }
    }

    /// Push still-pending tasks down to a lower priority. Running and
    /// finished tasks are left alone.
    pub fn downgrade_task_priorities<I>(&self, task_ids: I, priority: Priority)
    where
        I: IntoIterator<Item = TaskId>,
    {
        let mut to_push: Vec<QueueEntry> = Vec::new();
        {
            let mut graph = self.graph.lock();
            for id in task_ids {
                let Some(task) = graph.get_mut(&id) else {
                    continue;
                };
                if task.priority <= priority
                    || task.state == TaskState::Running
                    || task.state.is_terminal()
                {
                    continue;
                }
                task.priority = priority;
                task.epoch = self.next_epoch();
                if task.dependencies.is_empty() {
                    task.state = TaskState::Queued;
                    to_push.push(QueueEntry {
                        priority,
                        seq: self.next_seq(),
                        id: id.clone(),
                        epoch: task.epoch,
                    });
                }
            }
        }
        for entry in to_push {
            self.queue.push(entry);
        }
    }

    // ── Cancellation ────────────────────────────────────────────────────

    /// Cooperatively cancel a task: signal its token and tombstone the
    /// queue entry. Returns whether the task was found.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let mut graph = self.graph.lock();
        if let Some(task) = graph.get_mut(task_id) {
            task.cancel.cancel();
            task.is_active = false;
            true
        } else {
            false
        }
    }

    /// Batch variant under a single lock acquisition.
    pub fn cancel_tasks<'a, I>(&self, task_ids: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut graph = self.graph.lock();
        let mut count = 0;
        for id in task_ids {
            if let Some(task) = graph.get_mut(id) {
                task.cancel.cancel();
                task.is_active = false;
                count += 1;
            }
        }
        count
    }

    // ── Introspection (pipeline + tests) ────────────────────────────────

    pub fn contains_task(&self, task_id: &str) -> bool {
        self.graph.lock().contains_key(task_id)
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.graph.lock().get(task_id).map(|t| t.state)
    }

    pub fn task_priority(&self, task_id: &str) -> Option<Priority> {
        self.graph.lock().get(task_id).map(|t| t.priority)
    }

    pub fn graph_len(&self) -> usize {
        self.graph.lock().len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn running_task_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Cancel token of a task, if it is in the graph. Used by callers that
    /// want to share the token across re-submissions.
    pub fn task_cancel_token(
        &self,
        task_id: &str,
    ) -> Option<tokio_util::sync::CancellationToken> {
        self.graph.lock().get(task_id).map(|t| t.cancel.clone())
    }

    /// Under one lock: stamp `session_id` onto the pending tasks among
    /// `task_ids` and report which of them exist in the graph at all.
    pub fn stamp_sessions<I>(&self, task_ids: I, session_id: Option<&str>) -> HashSet<TaskId>
    where
        I: IntoIterator<Item = TaskId>,
    {
        let mut graph = self.graph.lock();
        let mut existing = HashSet::new();
        for id in task_ids {
            if let Some(task) = graph.get_mut(&id) {
                if let Some(session) = session_id
                    && task.state != TaskState::Running
                    && !task.state.is_terminal()
                {
                    task.session_id = Some(session.to_string());
                }
                existing.insert(id);
            }
        }
        existing
    }

    // ── Worker loop ─────────────────────────────────────────────────────

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "worker started");
        loop {
            let Some(entry) = self.queue.pop(POP_TIMEOUT).await else {
                continue;
            };
            if entry.id == SHUTDOWN_SENTINEL {
                debug!(worker_id, "worker received shutdown sentinel");
                self.queue.task_done();
                break;
            }

            // Claim the task under the graph lock; stale or tombstoned
            // entries release their queue slot without running.
            let claimed = {
                let mut graph = self.graph.lock();
                match graph.get_mut(&entry.id) {
                    Some(task) if task.epoch == entry.epoch && task.is_active => {
                        task.state = TaskState::Running;
                        task.worker_id = Some(worker_id);
                        Some((
                            task.func.clone(),
                            task.cancel.clone(),
                            task.on_complete.clone(),
                            task.session_id.clone(),
                        ))
                    }
                    _ => None,
                }
            };
            let Some((func, cancel, on_complete, session_id)) = claimed else {
                self.queue.task_done();
                continue;
            };
            self.active.lock().insert(worker_id, entry.id.clone());

            let result: StoredResult = if cancel.is_cancelled() {
                // Cancelled between queueing and execution: complete
                // without invoking the work.
                Ok(TaskOutput::None)
            } else {
                let ctx = TaskContext {
                    task_id: entry.id.clone(),
                    worker_id,
                    cancel: cancel.clone(),
                    session_id,
                };
                match AssertUnwindSafe(func(ctx)).catch_unwind().await {
                    Ok(result) => result.map_err(Arc::new),
                    Err(_) => Err(Arc::new(CoreError::Internal(format!(
                        "task '{}' panicked",
                        entry.id
                    )))),
                }
            };

            {
                let mut graph = self.graph.lock();
                if let Some(task) = graph.get_mut(&entry.id) {
                    task.state = if result.is_ok() {
                        TaskState::Completed
                    } else {
                        TaskState::Failed
                    };
                    // Retained for late-submission callbacks while the
                    // task survives pruning.
                    task.result = Some(result.clone());
                }
            }
            if let Err(err) = &result {
                error!(task_id = %entry.id, error = %err, "task failed");
            }

            self.on_task_finished(&entry.id);
            self.deliver_callbacks(&entry.id, &result);

            if let Some(hook) = on_complete
                && std::panic::catch_unwind(AssertUnwindSafe(|| hook())).is_err()
            {
                error!(task_id = %entry.id, "on_complete hook panicked");
            }

            self.active.lock().remove(&worker_id);
            self.queue.task_done();
        }
        debug!(worker_id, "worker exited");
    }

    /// Unlock dependents and prune finished leaves.
    fn on_task_finished(&self, task_id: &str) {
        let mut to_push: Vec<QueueEntry> = Vec::new();
        {
            let mut graph = self.graph.lock();
            let (dependents, dependencies) = match graph.get(task_id) {
                Some(task) => (
                    task.dependents.iter().cloned().collect::<Vec<_>>(),
                    task.dependencies.iter().cloned().collect::<Vec<_>>(),
                ),
                None => return,
            };

            for dependent_id in &dependents {
                if let Some(dependent) = graph.get_mut(dependent_id) {
                    dependent.dependencies.remove(task_id);
                    if dependent.dependencies.is_empty()
                        && dependent.state == TaskState::Pending
                    {
                        debug!(
                            finished = %task_id,
                            unlocked = %dependent_id,
                            "dependency satisfied, queueing dependent"
                        );
                        dependent.state = TaskState::Queued;
                        to_push.push(QueueEntry {
                            priority: dependent.priority,
                            seq: self.next_seq(),
                            id: dependent_id.clone(),
                            epoch: dependent.epoch,
                        });
                    }
                }
            }

            // Prune terminal tasks nobody depends on; cascade one level to
            // predecessors that became dependent-less leaves.
            if dependents.is_empty() {
                graph.remove(task_id);
                for dep_id in dependencies {
                    if let Some(dep) = graph.get_mut(&dep_id) {
                        dep.dependents.remove(task_id);
                        if dep.dependents.is_empty() && dep.state.is_terminal() {
                            graph.remove(&dep_id);
                        }
                    }
                }
            }
        }
        for entry in to_push {
            self.queue.push(entry);
        }
    }

    fn deliver_callbacks(&self, task_id: &str, result: &StoredResult) {
        if self.shutting_down.load(Ordering::SeqCst) {
            self.callbacks.lock().remove(task_id);
            return;
        }
        let callbacks = self.callbacks.lock().remove(task_id).unwrap_or_default();
        for cb in callbacks {
            let delivery = std::panic::catch_unwind(AssertUnwindSafe(|| match result {
                Ok(output) => cb(task_id, Ok(output)),
                Err(err) => cb(task_id, Err(err.as_ref())),
            }));
            if delivery.is_err() {
                error!(task_id = %task_id, "task callback panicked");
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Phase one: stop accepting submissions. Running tasks continue.
    pub fn prepare_for_shutdown(&self) {
        info!("scheduler preparing for shutdown; rejecting new tasks");
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Phase two: cancel jobs, drop queued tasks, stop workers. Blocks
    /// until workers exit or `timeout` elapses. Idempotent.
    pub async fn shutdown(&self, timeout: Duration) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("scheduler already shut down");
            return;
        }
        info!("scheduler shutting down; discarding pending tasks");
        self.shutting_down.store(true, Ordering::SeqCst);

        // Cancel active source jobs so they stop rescheduling slices.
        for (_, handle) in self.jobs.lock().drain() {
            handle.cancelled.cancel();
        }

        // Drain queued-but-unstarted tasks and drop them from the graph.
        let mut discarded = 0usize;
        {
            let mut graph = self.graph.lock();
            while let Some(entry) = self.queue.try_pop() {
                self.queue.task_done();
                let still_queued = graph
                    .get(&entry.id)
                    .is_some_and(|t| t.epoch == entry.epoch && t.state == TaskState::Queued);
                if still_queued {
                    if let Some(task) = graph.remove(&entry.id) {
                        for dep_id in &task.dependencies {
                            if let Some(dep) = graph.get_mut(dep_id) {
                                dep.dependents.remove(&entry.id);
                            }
                        }
                        discarded += 1;
                    }
                }
            }
        }
        if discarded > 0 {
            info!(discarded, "discarded pending tasks");
        }

        // One sentinel per worker so each exits after its current task.
        for _ in 0..self.workers {
            self.queue.push(QueueEntry {
                priority: Priority::Shutdown,
                seq: self.next_seq(),
                id: SHUTDOWN_SENTINEL.to_string(),
                epoch: 0,
            });
        }

        let handles: Vec<_> = self.worker_handles.lock().drain(..).collect();
        let all_joined = tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_ok();
        if all_joined {
            // Safe only when every worker exited: a stuck worker never
            // acknowledges its in-flight entry and join would hang.
            self.queue.join().await;
        } else {
            warn!("some workers did not stop within the shutdown timeout");
        }

        self.graph.lock().clear();
        info!("scheduler shutdown complete");
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("workers", &self.workers)
            .field("graph_len", &self.graph.lock().len())
            .field("queue_len", &self.queue.len())
            .field("jobs", &self.jobs.lock().len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
