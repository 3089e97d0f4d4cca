//! Supervised background tasks with two-phase shutdown.
//!
//! A [`Stopper`] owns two groups of work: short-lived async tasks (lease
//! releases and similar fire-and-forget jobs) and long-running workers
//! (refresh loops). Shutdown first quiesces: new tasks are refused and
//! in-flight tasks are awaited. Only then are workers told to stop.

use std::future::Future;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct Stopper {
    quiesce: CancellationToken,
    stop: CancellationToken,
    tasks: TaskTracker,
    workers: TaskTracker,
}

impl Default for Stopper {
    fn default() -> Stopper {
        Stopper::new()
    }
}

impl Stopper {
    pub fn new() -> Stopper {
        Stopper {
            quiesce: CancellationToken::new(),
            stop: CancellationToken::new(),
            tasks: TaskTracker::new(),
            workers: TaskTracker::new(),
        }
    }

    /// Spawns a supervised task. Refused once the stopper is quiescing.
    pub fn run_async_task<F>(&self, name: &'static str, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.quiesce.is_cancelled() {
            bail!("stopper is quiescing; refusing task {name}");
        }
        self.tasks.spawn(fut);
        Ok(())
    }

    /// Spawns a long-running worker. Workers observe [`Stopper::should_stop`]
    /// and exit on their own; they are awaited after all tasks have drained.
    pub fn run_worker<F>(&self, _name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.workers.spawn(fut);
    }

    /// Token cancelled when shutdown begins. Retry loops use this as their
    /// closer so background work abandons promptly.
    pub fn should_quiesce(&self) -> CancellationToken {
        self.quiesce.clone()
    }

    /// Token cancelled after all tasks have drained; workers exit on it.
    pub fn should_stop(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_quiescing(&self) -> bool {
        self.quiesce.is_cancelled()
    }

    /// Quiesce, await task completion, then stop workers and await them.
    pub async fn stop(&self) {
        self.quiesce.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.stop.cancel();
        self.workers.close();
        self.workers.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_waits_for_tasks_and_workers() {
        let stopper = Arc::new(Stopper::new());
        let task_done = Arc::new(AtomicBool::new(false));
        let worker_done = Arc::new(AtomicBool::new(false));

        let flag = task_done.clone();
        stopper
            .run_async_task("test-task", async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .expect("task accepted");

        let flag = worker_done.clone();
        let stop = stopper.should_stop();
        stopper.run_worker("test-worker", async move {
            stop.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });

        stopper.stop().await;
        assert!(task_done.load(Ordering::SeqCst));
        assert!(worker_done.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tasks_refused_after_quiesce() {
        let stopper = Stopper::new();
        stopper.stop().await;
        assert!(stopper.is_quiescing());
        assert!(stopper.run_async_task("late", async {}).is_err());
    }
}
