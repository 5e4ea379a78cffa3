//! Bounded elastic worker pool.
//!
//! A fixed-capacity task queue feeds a set of workers that grows on demand
//! up to a ceiling and shrinks again as workers idle out. Worker tokens are
//! semaphore permits: holding a permit is being alive, so the ceiling can
//! never be exceeded and shutdown can close the semaphore to refuse new
//! spawns.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::{CancelHandle, Task};
use crate::types::{GroveError, Result};

/// How long a worker waits without work before it exits.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<dyn Task>>>>;

pub struct WorkerPool {
    /// Queue sender; taken on shutdown so the channel closes.
    queue: RwLock<Option<mpsc::Sender<Arc<dyn Task>>>>,
    /// Receiver shared by all workers.
    receiver: SharedReceiver,
    /// One permit per live worker, up to the ceiling.
    tokens: Arc<Semaphore>,
    live: Arc<AtomicUsize>,
    worker_seq: Arc<AtomicUsize>,
    idle_timeout: Duration,
}

impl WorkerPool {
    /// Create a pool with `min_workers` spawned immediately, a ceiling of
    /// `max_workers`, and a queue of `queue_size` slots.
    pub fn new(min_workers: usize, max_workers: usize, queue_size: usize) -> Self {
        Self::with_idle_timeout(min_workers, max_workers, queue_size, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        min_workers: usize,
        max_workers: usize,
        queue_size: usize,
        idle_timeout: Duration,
    ) -> Self {
        let max_workers = max_workers.max(1);
        let min_workers = min_workers.min(max_workers);
        let (tx, rx) = mpsc::channel::<Arc<dyn Task>>(queue_size.max(1));

        let pool = Self {
            queue: RwLock::new(Some(tx)),
            receiver: Arc::new(tokio::sync::Mutex::new(rx)),
            tokens: Arc::new(Semaphore::new(max_workers)),
            live: Arc::new(AtomicUsize::new(0)),
            worker_seq: Arc::new(AtomicUsize::new(0)),
            idle_timeout,
        };

        for _ in 0..min_workers {
            let permit = pool
                .tokens
                .clone()
                .try_acquire_owned()
                .expect("fresh semaphore has a permit per worker");
            pool.spawn_worker(None, permit);
        }

        info!(
            min_workers,
            max_workers,
            queue_size,
            "worker pool started"
        );
        pool
    }

    /// Submit a task.
    ///
    /// The task is either queued, or handed as the first task to a freshly
    /// spawned worker when the ceiling allows one. With no timeout the call
    /// blocks until a queue slot or worker token frees up; with a timeout it
    /// fails with `Timeout` without enqueueing.
    pub async fn submit(
        &self,
        task: Arc<dyn Task>,
        timeout: Option<Duration>,
    ) -> Result<CancelHandle> {
        let sender = self
            .queue
            .read()
            .expect("queue lock")
            .clone()
            .ok_or_else(|| GroveError::Canceled("worker pool is shutting down".to_string()))?;

        match timeout {
            Some(wait) => {
                tokio::select! {
                    slot = sender.reserve() => self.dispatch_to_slot(slot, &task)?,
                    token = self.tokens.clone().acquire_owned() => self.dispatch_to_worker(token, &task)?,
                    _ = tokio::time::sleep(wait) => {
                        return Err(GroveError::Timeout(format!(
                            "no queue slot or worker available within {wait:?}"
                        )));
                    }
                }
            }
            None => {
                tokio::select! {
                    slot = sender.reserve() => self.dispatch_to_slot(slot, &task)?,
                    token = self.tokens.clone().acquire_owned() => self.dispatch_to_worker(token, &task)?,
                }
            }
        }

        Ok(CancelHandle::new(task))
    }

    fn dispatch_to_slot(
        &self,
        slot: std::result::Result<mpsc::Permit<'_, Arc<dyn Task>>, mpsc::error::SendError<()>>,
        task: &Arc<dyn Task>,
    ) -> Result<()> {
        let slot =
            slot.map_err(|_| GroveError::Canceled("worker pool is shutting down".to_string()))?;
        slot.send(task.clone());
        Ok(())
    }

    fn dispatch_to_worker(
        &self,
        token: std::result::Result<OwnedSemaphorePermit, tokio::sync::AcquireError>,
        task: &Arc<dyn Task>,
    ) -> Result<()> {
        let token =
            token.map_err(|_| GroveError::Canceled("worker pool is shutting down".to_string()))?;
        self.spawn_worker(Some(task.clone()), token);
        Ok(())
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Shut the pool down: close the queue, cancel everything still queued,
    /// and refuse future worker spawns. Workers drain and exit.
    pub async fn shutdown(&self) {
        let sender = self.queue.write().expect("queue lock").take();
        drop(sender);

        let mut receiver = self.receiver.lock().await;
        while let Ok(task) = receiver.try_recv() {
            if task.state().cancel() {
                debug!(task = task.id(), "task canceled on shutdown");
            }
        }
        drop(receiver);

        self.tokens.close();
        info!("worker pool shut down");
    }

    fn spawn_worker(&self, first_task: Option<Arc<dyn Task>>, token: OwnedSemaphorePermit) {
        let worker_id = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let receiver = self.receiver.clone();
        let live = self.live.clone();
        let idle_timeout = self.idle_timeout;

        live.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            let _token = token;
            debug!(worker = worker_id, "worker started");

            if let Some(task) = first_task {
                if task.state().is_ignorable() {
                    debug!(task = task.id(), "first task already canceled or done");
                } else {
                    run_task(worker_id, &*task).await;
                }
            }

            let mut last_active = Instant::now();
            loop {
                let next = async {
                    let mut receiver = receiver.lock().await;
                    receiver.recv().await
                };
                match tokio::time::timeout(idle_timeout, next).await {
                    Ok(Some(task)) => {
                        if task.state().is_ignorable() {
                            debug!(task = task.id(), "task already canceled or done");
                            continue;
                        }
                        run_task(worker_id, &*task).await;
                        last_active = Instant::now();
                    }
                    // Queue closed and drained.
                    Ok(None) => break,
                    Err(_) => {
                        if last_active.elapsed() >= idle_timeout {
                            debug!(worker = worker_id, "worker idle, exiting");
                            break;
                        }
                    }
                }
            }

            live.fetch_sub(1, Ordering::AcqRel);
            debug!(worker = worker_id, "worker stopped");
        });
    }
}

/// Run one task, isolating panics so the worker survives.
async fn run_task(worker_id: usize, task: &dyn Task) {
    let outcome = AssertUnwindSafe(task.process()).catch_unwind().await;
    if let Err(panic) = outcome {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(worker = worker_id, task = task.id(), "task panicked: {message}");
    }
    task.state().complete();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::TaskState;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct CountingTask {
        id: String,
        state: TaskState,
        runs: Arc<AtomicU32>,
        delay: Duration,
    }

    impl CountingTask {
        fn new(id: usize, runs: Arc<AtomicU32>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                state: TaskState::new(),
                runs,
                delay,
            })
        }
    }

    #[async_trait]
    impl Task for CountingTask {
        fn id(&self) -> &str {
            &self.id
        }

        fn state(&self) -> &TaskState {
            &self.state
        }

        async fn process(&self) {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.runs.fetch_add(1, Ordering::AcqRel);
        }
    }

    struct PanickingTask {
        state: TaskState,
    }

    #[async_trait]
    impl Task for PanickingTask {
        fn id(&self) -> &str {
            "panicking"
        }

        fn state(&self) -> &TaskState {
            &self.state
        }

        async fn process(&self) {
            panic!("boom");
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_all_submitted_tasks_run() {
        let pool = WorkerPool::new(2, 4, 8);
        let runs = Arc::new(AtomicU32::new(0));

        for i in 0..20 {
            let task = CountingTask::new(i, runs.clone(), Duration::ZERO);
            pool.submit(task, None).await.unwrap();
        }

        wait_until(|| runs.load(Ordering::Acquire) == 20).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_canceled_queued_tasks_are_skipped() {
        // One slow worker, queue big enough to hold the backlog.
        let pool = WorkerPool::new(1, 1, 16);
        let runs = Arc::new(AtomicU32::new(0));

        // Occupy the lone worker.
        let blocker = CountingTask::new(0, runs.clone(), Duration::from_millis(300));
        pool.submit(blocker, None).await.unwrap();

        let mut handles = Vec::new();
        for i in 1..=10 {
            let task = CountingTask::new(i, runs.clone(), Duration::ZERO);
            handles.push(pool.submit(task, None).await.unwrap());
        }

        // Cancel two while they are still queued behind the blocker.
        assert!(handles[2].cancel());
        assert!(handles[6].cancel());
        assert!(!handles[2].cancel());

        wait_until(|| runs.load(Ordering::Acquire) == 9).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::Acquire), 9);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_ceiling_respected() {
        let pool = WorkerPool::new(2, 4, 4);
        let runs = Arc::new(AtomicU32::new(0));

        for i in 0..12 {
            let task = CountingTask::new(i, runs.clone(), Duration::from_millis(50));
            pool.submit(task, None).await.unwrap();
        }
        assert!(pool.worker_count() <= 4);

        wait_until(|| runs.load(Ordering::Acquire) == 12).await;
        assert!(pool.worker_count() <= 4);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_timeout_when_saturated() {
        let pool = WorkerPool::new(1, 1, 1);
        let runs = Arc::new(AtomicU32::new(0));

        // Fill the lone worker and the single queue slot.
        let blocker = CountingTask::new(0, runs.clone(), Duration::from_secs(5));
        pool.submit(blocker, None).await.unwrap();
        let queued = CountingTask::new(1, runs.clone(), Duration::ZERO);
        pool.submit(queued, None).await.unwrap();

        let rejected = CountingTask::new(2, runs.clone(), Duration::ZERO);
        let err = pool
            .submit(rejected.clone(), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, GroveError::Timeout(_)));
        assert!(!rejected.state.is_completed());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_workers_exit() {
        let pool = WorkerPool::with_idle_timeout(2, 4, 4, Duration::from_millis(80));
        assert_eq!(pool.worker_count(), 2);

        wait_until(|| pool.worker_count() == 0).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panic_does_not_kill_worker() {
        let pool = WorkerPool::new(1, 1, 4);
        let runs = Arc::new(AtomicU32::new(0));

        let bad: Arc<dyn Task> = Arc::new(PanickingTask {
            state: TaskState::new(),
        });
        pool.submit(bad.clone(), None).await.unwrap();

        let good = CountingTask::new(1, runs.clone(), Duration::ZERO);
        pool.submit(good, None).await.unwrap();

        wait_until(|| runs.load(Ordering::Acquire) == 1).await;
        assert!(bad.state().is_completed());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::new(1, 2, 4);
        pool.shutdown().await;

        let task = CountingTask::new(0, Arc::new(AtomicU32::new(0)), Duration::ZERO);
        let err = pool.submit(task, None).await.unwrap_err();
        assert!(matches!(err, GroveError::Canceled(_)));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_tasks() {
        let pool = WorkerPool::new(1, 1, 8);
        let runs = Arc::new(AtomicU32::new(0));

        let blocker = CountingTask::new(0, runs.clone(), Duration::from_millis(200));
        pool.submit(blocker, None).await.unwrap();

        let queued = CountingTask::new(1, runs.clone(), Duration::ZERO);
        pool.submit(queued.clone(), None).await.unwrap();

        pool.shutdown().await;
        assert!(queued.state.is_canceled());
    }
}
