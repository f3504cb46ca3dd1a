//! Bounded Worker Pool - reusable workers with a blocking submit
//!
//! At most `capacity` scheduled tasks run at any instant. `schedule` only
//! returns once the task holds one of the `capacity` execution slots, so a
//! saturated pool pushes back on whoever is submitting. Workers are spawned
//! lazily up to `capacity` and then reused for every later task.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

use crate::metrics_consts::WORKER_TASK_PANICS;

type Task = BoxFuture<'static, ()>;

/// A task plus the execution slot it occupies until it finishes.
type Job = (Task, OwnedSemaphorePermit);

pub struct WorkerPool {
    capacity: usize,
    slots: Arc<Semaphore>,
    spawned: AtomicUsize,
    handoff_tx: mpsc::UnboundedSender<Job>,
    handoff_rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
}

impl WorkerPool {
    /// Create a pool with no live workers.
    ///
    /// Panics if `capacity` is zero, which could never run anything.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "worker pool capacity must be positive");
        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();

        Self {
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
            spawned: AtomicUsize::new(0),
            handoff_tx,
            handoff_rx: Arc::new(Mutex::new(handoff_rx)),
        }
    }

    /// Submit a unit of work, waiting while the pool is saturated.
    ///
    /// Returns once the task is handed to a worker, not once it completes.
    pub async fn schedule<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                // the semaphore is never closed while the pool is alive
                error!("worker pool semaphore closed: {e}");
                return;
            }
        };

        let task: Task = Box::pin(task);
        if self.reserve_worker() {
            self.spawn_worker(task, permit);
        } else if self.handoff_tx.send((task, permit)).is_err() {
            error!("worker pool handoff queue closed, dropping task");
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of workers spawned so far; never exceeds `capacity`.
    pub fn live_workers(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Number of execution slots currently taken.
    pub fn busy(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    fn reserve_worker(&self) -> bool {
        self.spawned
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    fn spawn_worker(&self, first: Task, permit: OwnedSemaphorePermit) {
        let handoff = self.handoff_rx.clone();
        let worker_id = self.live_workers();

        tokio::spawn(async move {
            debug!(worker_id, "worker started");
            run_task(first).await;
            drop(permit);

            loop {
                // only one idle worker waits on the queue, the rest wait on the lock
                let next = {
                    let mut rx = handoff.lock().await;
                    rx.recv().await
                };
                match next {
                    Some((task, permit)) => {
                        run_task(task).await;
                        drop(permit);
                    }
                    None => break,
                }
            }
            debug!(worker_id, "worker exiting, pool dropped");
        });
    }
}

/// Run a task, containing any panic so the worker survives it.
async fn run_task(task: Task) {
    if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
        metrics::counter!(WORKER_TASK_PANICS).increment(1);
        error!(panic = panic_message(&*panic), "task panicked on worker");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
