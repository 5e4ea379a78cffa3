//! Task contract and worker pool.

mod pool;

pub use pool::{WorkerPool, DEFAULT_IDLE_TIMEOUT};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Completion and cancellation flags shared by every task kind.
///
/// Completion is exclusive: once `complete` (or a successful `cancel`) has
/// set the done flag, `cancel` returns false forever after.
#[derive(Debug, Default)]
pub struct TaskState {
    done: AtomicBool,
    cancelled: AtomicBool,
}

impl TaskState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the task done after processing.
    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Cancel the task. Returns true exactly once, and never after the task
    /// has completed. Cancelling does not preempt a running `process`; it
    /// marks the task ignorable for any later dequeue.
    pub fn cancel(&self) -> bool {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.cancelled.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn is_completed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn is_canceled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// A completed or cancelled task must not be processed if dequeued.
    pub fn is_ignorable(&self) -> bool {
        self.is_completed() || self.is_canceled()
    }
}

/// A unit of work the pool can run.
#[async_trait]
pub trait Task: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> &TaskState;

    async fn process(&self);
}

/// Handle returned by `submit`, bound to the task's cancel flag.
#[derive(Clone)]
pub struct CancelHandle {
    task: Arc<dyn Task>,
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("task_id", &self.task.id())
            .finish()
    }
}

impl CancelHandle {
    pub(crate) fn new(task: Arc<dyn Task>) -> Self {
        Self { task }
    }

    pub fn task_id(&self) -> &str {
        self.task.id()
    }

    /// Cancel the underlying task; false when it already completed.
    pub fn cancel(&self) -> bool {
        self.task.state().cancel()
    }
}
