//! Bounded worker pool for dispatch fanout and response processing.
//!
//! Workers spawn on demand up to the pool bound and exit after the idle
//! timeout; a dispatcher hands queued closures to ready workers. Submission
//! after [`Pool::stop`] is rejected; closures already handed to a worker
//! still complete.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tsq_common::PoolStatistics;

/// One schedulable closure with an optional panic handler.
pub struct Task {
    exec: Box<dyn FnOnce() + Send + 'static>,
    on_panic: Option<Box<dyn FnOnce(String) + Send + 'static>>,
}

impl Task {
    /// Wrap a closure for submission.
    pub fn new(exec: impl FnOnce() + Send + 'static) -> Self {
        Self {
            exec: Box::new(exec),
            on_panic: None,
        }
    }

    /// Attach a handler receiving the recovered panic message.
    ///
    /// Tasks without a handler log the panic and drop it.
    pub fn with_panic_handler(mut self, handler: impl FnOnce(String) + Send + 'static) -> Self {
        self.on_panic = Some(Box::new(handler));
        self
    }
}

struct Entry {
    task: Task,
    cancel: CancellationToken,
}

/// Bounded pool running short closures with a cancellation context.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolShared>,
}

struct PoolShared {
    tasks_tx: mpsc::UnboundedSender<Entry>,
    shutdown: CancellationToken,
    statistics: PoolStatistics,
}

impl Pool {
    /// Create a pool named `name` with at most `max_workers` workers.
    ///
    /// A zero `idle_timeout` keeps workers alive for the pool lifetime.
    pub fn new(
        name: &str,
        max_workers: usize,
        idle_timeout: Duration,
        statistics: PoolStatistics,
    ) -> Self {
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher {
            name: name.to_string(),
            max_workers: max_workers.max(1),
            idle_timeout,
            shutdown: shutdown.clone(),
            statistics: statistics.clone(),
            alive: Arc::new(AtomicUsize::new(0)),
        };
        tokio::spawn(dispatcher.run(tasks_rx));
        Self {
            inner: Arc::new(PoolShared {
                tasks_tx,
                shutdown,
                statistics,
            }),
        }
    }

    /// Schedule `task`; dropped without running when `cancel` fires first
    /// or the pool is stopped.
    pub fn submit(&self, cancel: &CancellationToken, task: Task) {
        if self.inner.shutdown.is_cancelled() {
            self.inner.statistics.tasks_rejected.inc();
            return;
        }
        let entry = Entry {
            task,
            cancel: cancel.clone(),
        };
        if self.inner.tasks_tx.send(entry).is_err() {
            self.inner.statistics.tasks_rejected.inc();
        }
    }

    /// Stop accepting submissions; idempotent. Inflight tasks complete.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }
}

struct Dispatcher {
    name: String,
    max_workers: usize,
    idle_timeout: Duration,
    shutdown: CancellationToken,
    statistics: PoolStatistics,
    alive: Arc<AtomicUsize>,
}

impl Dispatcher {
    async fn run(self, mut tasks_rx: mpsc::UnboundedReceiver<Entry>) {
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<mpsc::Sender<Entry>>();
        loop {
            let entry = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                maybe = tasks_rx.recv() => match maybe {
                    Some(entry) => entry,
                    None => break,
                },
            };
            if entry.cancel.is_cancelled() {
                self.statistics.tasks_rejected.inc();
                continue;
            }
            self.dispatch(entry, &ready_tx, &mut ready_rx).await;
        }
        // reject whatever is still queued
        while let Ok(_entry) = tasks_rx.try_recv() {
            self.statistics.tasks_rejected.inc();
        }
    }

    async fn dispatch(
        &self,
        mut entry: Entry,
        ready_tx: &mpsc::UnboundedSender<mpsc::Sender<Entry>>,
        ready_rx: &mut mpsc::UnboundedReceiver<mpsc::Sender<Entry>>,
    ) {
        loop {
            // a ready worker may have idled out in the meantime; retry with
            // the returned entry until one accepts it
            if let Ok(worker) = ready_rx.try_recv() {
                match worker.try_send(entry) {
                    Ok(()) => return,
                    Err(err) => {
                        entry = err.into_inner();
                        continue;
                    }
                }
            }
            if self.alive.load(Ordering::Relaxed) < self.max_workers {
                let worker = self.spawn_worker(ready_tx.clone());
                if let Err(err) = worker.try_send(entry) {
                    entry = err.into_inner();
                    continue;
                }
                return;
            }
            let waited = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                maybe = ready_rx.recv() => maybe,
            };
            match waited {
                Some(worker) => match worker.try_send(entry) {
                    Ok(()) => return,
                    Err(err) => {
                        entry = err.into_inner();
                        continue;
                    }
                },
                None => {
                    self.statistics.tasks_rejected.inc();
                    return;
                }
            }
        }
    }

    fn spawn_worker(
        &self,
        ready_tx: mpsc::UnboundedSender<mpsc::Sender<Entry>>,
    ) -> mpsc::Sender<Entry> {
        let (tx, mut rx) = mpsc::channel::<Entry>(1);
        self.alive.fetch_add(1, Ordering::Relaxed);
        self.statistics.workers_created.inc();
        self.statistics.workers_alive.inc();

        let worker_tx = tx.clone();
        let name = self.name.clone();
        let idle_timeout = self.idle_timeout;
        let shutdown = self.shutdown.clone();
        let statistics = self.statistics.clone();
        let alive = Arc::clone(&self.alive);
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    maybe = recv_until_idle(&mut rx, idle_timeout) => maybe,
                };
                // drain an entry buffered during the stop/idle race so an
                // already-dispatched task still completes
                let received = received.or_else(|| rx.try_recv().ok());
                let Some(entry) = received else { break };
                run_entry(&name, entry, &statistics);
                if ready_tx.send(worker_tx.clone()).is_err() {
                    break;
                }
            }
            statistics.workers_alive.dec();
            alive.fetch_sub(1, Ordering::Relaxed);
        });
        tx
    }
}

async fn recv_until_idle(rx: &mut mpsc::Receiver<Entry>, idle_timeout: Duration) -> Option<Entry> {
    if idle_timeout.is_zero() {
        rx.recv().await
    } else {
        tokio::time::timeout(idle_timeout, rx.recv())
            .await
            .ok()
            .flatten()
    }
}

fn run_entry(pool_name: &str, entry: Entry, statistics: &PoolStatistics) {
    if entry.cancel.is_cancelled() {
        statistics.tasks_rejected.inc();
        return;
    }
    let Task { exec, on_panic } = entry.task;
    if let Err(panic) = catch_unwind(AssertUnwindSafe(exec)) {
        let message = panic_message(panic.as_ref());
        match on_panic {
            Some(handler) => handler(message),
            None => error!(pool = %pool_name, panic = %message, "worker task panicked"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;
    use std::sync::atomic::AtomicI32;

    fn test_pool(max_workers: usize, idle_timeout: Duration) -> (Pool, PoolStatistics) {
        let statistics = PoolStatistics::new("test", &Registry::new());
        let pool = Pool::new("test", max_workers, idle_timeout, statistics.clone());
        (pool, statistics)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runs_submitted_tasks() {
        let (pool, _stats) = test_pool(2, Duration::ZERO);
        let counter = Arc::new(AtomicI32::new(0));
        let cancel = CancellationToken::new();
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(
                &cancel,
                Task::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        wait_until(|| counter.load(Ordering::SeqCst) == 100).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_is_idempotent_and_rejects_submissions() {
        let (pool, stats) = test_pool(2, Duration::ZERO);
        let cancel = CancellationToken::new();
        pool.stop();
        pool.stop();
        pool.submit(&cancel, Task::new(|| {}));
        pool.submit(&cancel, Task::new(|| {}));
        assert_eq!(stats.tasks_rejected.get(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panic_handler_receives_message() {
        let (pool, _stats) = test_pool(1, Duration::ZERO);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        pool.submit(
            &cancel,
            Task::new(|| panic!("boom")).with_panic_handler(move |msg| {
                let _ = tx.send(msg);
            }),
        );
        let msg = rx.recv().await.expect("panic message");
        assert!(msg.contains("boom"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_tasks_are_dropped() {
        let (pool, stats) = test_pool(1, Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let counter = Arc::new(AtomicI32::new(0));
        let c = Arc::clone(&counter);
        pool.submit(
            &cancel,
            Task::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        wait_until(|| stats.tasks_rejected.get() == 1).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn workers_exit_after_idle_timeout() {
        let (pool, stats) = test_pool(2, Duration::from_millis(50));
        let cancel = CancellationToken::new();
        pool.submit(&cancel, Task::new(|| {}));
        wait_until(|| stats.workers_created.get() >= 1).await;
        wait_until(|| stats.workers_alive.get() == 0).await;
        // a later submission respawns a worker
        let counter = Arc::new(AtomicI32::new(0));
        let c = Arc::clone(&counter);
        pool.submit(
            &cancel,
            Task::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        wait_until(|| counter.load(Ordering::SeqCst) == 1).await;
        assert!(stats.workers_created.get() >= 2);
    }
}
