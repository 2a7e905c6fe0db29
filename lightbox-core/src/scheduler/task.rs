//! Task model: the addressable unit of work the scheduler orders and runs.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use lightbox_protocol::Priority;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};

/// Task ids are opaque strings; collisions are the dedup/upgrade key and
/// are used intentionally (`"view::<path>"`, `"meta::<path>"`, ...).
pub type TaskId = String;

/// Lifecycle of a task inside the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Value a task function produces; delivered to registered callbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TaskOutput {
    /// Work done (or skipped) with nothing to report.
    #[default]
    None,
    /// A cache file was produced or confirmed.
    CachePath(PathBuf),
}

/// Execution context handed to a task function.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub worker_id: usize,
    /// Cooperative cancellation flag; long tasks check it before expensive
    /// steps.
    pub cancel: CancellationToken,
    /// GUI session the task was requested for, if any. Stamped by the
    /// pipeline so stale view-image work can be abandoned.
    pub session_id: Option<String>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("worker_id", &self.worker_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// The work itself. Cloneable so dedup upgrades can re-queue a task
/// without losing its closure.
pub type TaskFn = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<TaskOutput>> + Send + Sync>;

/// Result delivery for interested callers; invoked once, outside the graph
/// lock, after the task reaches a terminal state.
pub type TaskCallback =
    Box<dyn FnOnce(&str, std::result::Result<&TaskOutput, &CoreError>) + Send>;

/// Fire-and-forget hook run after a task finishes (success or failure).
pub type OnComplete = Arc<dyn Fn() + Send + Sync>;

/// Terminal result retained on the graph record while the task still has
/// dependents, so a later submission of the same id can replay the known
/// result to its callback. The error is shared: callbacks only ever see
/// it by reference.
pub(crate) type StoredResult = std::result::Result<TaskOutput, Arc<CoreError>>;

/// Wrap an async closure as a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<TaskOutput>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Everything a caller specifies when submitting a task.
#[derive(Clone)]
pub struct TaskSpec {
    pub id: TaskId,
    pub priority: Priority,
    pub func: TaskFn,
    pub dependencies: HashSet<TaskId>,
    pub on_complete: Option<OnComplete>,
    /// External cancel token; adopted only if the task does not already
    /// carry one from a previous submission.
    pub cancel: Option<CancellationToken>,
    pub session_id: Option<String>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, priority: Priority, func: TaskFn) -> Self {
        Self {
            id: id.into(),
            priority,
            func,
            dependencies: HashSet::new(),
            on_complete: None,
            cancel: None,
            session_id: None,
        }
    }

    pub fn with_dependencies<I>(mut self, deps: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_on_complete(mut self, hook: OnComplete) -> Self {
        self.on_complete = Some(hook);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Graph-resident task record. The graph is the single source of truth;
/// queue entries only reference it by `(id, epoch)`.
pub(crate) struct Task {
    pub id: TaskId,
    pub priority: Priority,
    /// Bumped whenever the queued entry for this task is invalidated
    /// (upgrade, downgrade, cancellation); a dequeued entry with a stale
    /// epoch is discarded unrun.
    pub epoch: u64,
    pub func: TaskFn,
    pub state: TaskState,
    pub dependencies: HashSet<TaskId>,
    pub dependents: HashSet<TaskId>,
    pub is_active: bool,
    pub cancel: CancellationToken,
    pub worker_id: Option<usize>,
    pub on_complete: Option<OnComplete>,
    pub session_id: Option<String>,
    /// Set together with the terminal state transition.
    pub result: Option<StoredResult>,
}

/// Outcome of a submission, mirroring the dedup/upgrade contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new task entered the graph.
    Submitted,
    /// An existing pending task was replaced at a higher priority.
    Upgraded,
    /// An existing pending task had its work payload refreshed in place.
    Updated,
    /// The task is running; only the callback was registered.
    AlreadyRunning,
    /// The task already finished; any callback fired immediately.
    AlreadyDone,
    /// The scheduler is shutting down.
    Rejected,
}

impl SubmitOutcome {
    /// True when the submission resulted in (eventual) execution of the
    /// submitted payload.
    pub fn accepted(self) -> bool {
        matches!(
            self,
            SubmitOutcome::Submitted | SubmitOutcome::Upgraded | SubmitOutcome::Updated
        )
    }
}
