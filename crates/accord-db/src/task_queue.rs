//! Single-flight async task queue.
//!
//! Serializes units of work so that at most one runs at a time per queue
//! instance. In [`QueueMode::Fifo`] every task runs in submission order; in
//! [`QueueMode::OnlyLatest`] a newly submitted task replaces any task that
//! has not started yet, which is how checkpoint persists coalesce bursts of
//! dispatches into a single ledger write.

use crate::{Error, Result};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// How the queue treats tasks submitted while busy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Run every task, strictly in submission order
    Fifo,
    /// Keep only the newest pending task; superseded tasks resolve with
    /// [`Error::Superseded`]. A task already running always finishes.
    OnlyLatest,
}

struct Queued<T> {
    fut: BoxFuture<'static, Result<T>>,
    done: oneshot::Sender<Result<T>>,
}

struct Inner<T> {
    queue: VecDeque<Queued<T>>,
    running: bool,
}

/// A named, single-flight task queue.
///
/// Cheap to clone; clones share the same queue.
pub struct TaskQueue<T> {
    name: Arc<str>,
    mode: QueueMode,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            mode: self.mode,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> TaskQueue<T> {
    /// Create a queue with the given name (used in log lines) and mode
    pub fn new(name: impl Into<String>, mode: QueueMode) -> Self {
        Self {
            name: name.into().into(),
            mode,
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                running: false,
            })),
        }
    }

    /// Enqueue a task and return a future resolving to its outcome.
    ///
    /// The task starts on the queue's worker, never inline in `send`, so an
    /// idle queue cannot re-enter the caller. A task's failure is delivered
    /// only to its own future and never stops the queue from draining.
    pub fn send(&self, fut: BoxFuture<'static, Result<T>>) -> impl std::future::Future<Output = Result<T>> {
        let (done, rx) = oneshot::channel();
        let spawn_worker = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if self.mode == QueueMode::OnlyLatest {
                while let Some(old) = inner.queue.pop_front() {
                    tracing::debug!(queue = %self.name, "superseding pending task");
                    let _ = old.done.send(Err(Error::Superseded));
                }
            }
            inner.queue.push_back(Queued { fut, done });
            if inner.running {
                false
            } else {
                inner.running = true;
                true
            }
        };

        if spawn_worker {
            let name = Arc::clone(&self.name);
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                Self::drain(name, inner).await;
            });
        }

        async move { rx.await.map_err(|_| Error::QueueClosed)? }
    }

    /// Run queued tasks one at a time until the queue is empty.
    async fn drain(name: Arc<str>, inner: Arc<Mutex<Inner<T>>>) {
        loop {
            let next = {
                let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
                match guard.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        // Checked and cleared under the same lock `send`
                        // pushes under, so no task can be stranded.
                        guard.running = false;
                        tracing::debug!(queue = %name, "queue drained");
                        return;
                    }
                }
            };
            let result = next.fut.await;
            if let Err(err) = &result {
                tracing::debug!(queue = %name, %err, "task finished with error");
            }
            let _ = next.done.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn fifo_runs_tasks_in_submission_order() {
        let queue = TaskQueue::new("fifo", QueueMode::Fifo);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5u32 {
            let order = Arc::clone(&order);
            handles.push(queue.send(Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                order.lock().unwrap().push(i);
                Ok(i)
            })));
        }
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.await.unwrap(), i as u32);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn task_error_does_not_stop_the_queue() {
        let queue: TaskQueue<u32> = TaskQueue::new("errors", QueueMode::Fifo);

        let failing = queue.send(Box::pin(async { Err(Error::precondition("boom")) }));
        let ok = queue.send(Box::pin(async { Ok(7) }));

        assert!(matches!(failing.await, Err(Error::Precondition(_))));
        assert_eq!(ok.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn only_latest_coalesces_bursts() {
        let queue: TaskQueue<()> = TaskQueue::new("persist", QueueMode::OnlyLatest);
        let gate = Arc::new(Notify::new());
        let runs = Arc::new(AtomicUsize::new(0));

        // First task starts and blocks on the gate.
        let first = {
            let gate = Arc::clone(&gate);
            let runs = Arc::clone(&runs);
            queue.send(Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok(())
            }))
        };
        tokio::task::yield_now().await;

        // Four more arrive while the first is still running; only the last
        // may survive the queue.
        let mut futures = Vec::new();
        for _ in 0..4 {
            let runs = Arc::clone(&runs);
            futures.push(queue.send(Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })));
        }
        gate.notify_one();

        let mut superseded = 0;
        let mut completed = 0;
        for f in futures {
            match f.await {
                Ok(()) => completed += 1,
                Err(Error::Superseded) => superseded += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        first.await.unwrap();

        assert_eq!(completed, 1);
        assert_eq!(superseded, 3);
        // The in-flight task plus the final coalesced one.
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_queue_restarts_its_worker() {
        let queue: TaskQueue<u32> = TaskQueue::new("restart", QueueMode::Fifo);
        assert_eq!(queue.send(Box::pin(async { Ok(1) })).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.send(Box::pin(async { Ok(2) })).await.unwrap(), 2);
    }
}
