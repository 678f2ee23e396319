//! Pool of OS-thread-pinned engine workers.
//!
//! Each worker is one named OS thread for its whole life. A caller takes an
//! idle worker, hands it a job, waits for the reply and puts the worker back,
//! so every engine call of one logical operation runs on the same native
//! thread.
//!
//! Invariant: at every quiescent point `idle + busy == size`.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use strata_common::crash_domain;
use strata_common::{StrataError, StrataResult};

thread_local! {
    static PINNED: Cell<bool> = const { Cell::new(false) };
}

/// True on a pool worker or an append-worker thread.
pub fn on_pinned_thread() -> bool {
    PINNED.with(|p| p.get())
}

/// Mark the current thread as owning its engine work.
pub(crate) fn pin_current_thread() {
    PINNED.with(|p| p.set(true));
}

/// Upper bound for the pool size: 2 × NumCPU.
pub fn hard_limit() -> usize {
    num_cpus() * 2
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Resolve a configured size: 0 = NumCPU, clamped to [`hard_limit`].
pub fn resolve_size(configured: usize) -> usize {
    let size = if configured == 0 { num_cpus() } else { configured };
    size.min(hard_limit())
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    id: usize,
    tx: Sender<Job>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(id: usize, pool: Arc<PoolInner>) -> StrataResult<Worker> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let handle = std::thread::Builder::new()
            .name(format!("strata-worker-{}", id))
            .spawn(move || {
                pin_current_thread();
                // recv drains queued jobs before reporting disconnect
                while let Ok(job) = rx.recv() {
                    job();
                    pool.total_jobs.fetch_add(1, Ordering::Relaxed);
                }
                tracing::debug!(worker = id, "pool worker exited");
            })?;
        Ok(Worker { id, tx, handle })
    }

    fn stop(self) {
        let Worker { id, tx, handle } = self;
        drop(tx);
        if handle.join().is_err() {
            tracing::warn!(worker = id, "pool worker panicked while stopping");
        }
    }
}

struct PoolInner {
    idle_tx: Sender<Worker>,
    idle_rx: Receiver<Worker>,
    size: AtomicUsize,
    busy: AtomicUsize,
    next_id: AtomicUsize,
    running: AtomicBool,
    total_jobs: AtomicU64,
    total_panics: AtomicU64,
    resize_lock: Mutex<()>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerPoolStats {
    pub size: usize,
    pub idle: usize,
    pub busy: usize,
    pub hard_limit: usize,
    pub total_jobs: u64,
    pub total_panics: u64,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size())
            .field("running", &self.is_running())
            .finish()
    }
}

impl WorkerPool {
    /// Start `size` workers (0 = NumCPU, clamped to the hard limit).
    pub fn start(size: usize) -> StrataResult<Self> {
        let (idle_tx, idle_rx) = crossbeam_channel::bounded(hard_limit());
        let pool = Self {
            inner: Arc::new(PoolInner {
                idle_tx,
                idle_rx,
                size: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                running: AtomicBool::new(true),
                total_jobs: AtomicU64::new(0),
                total_panics: AtomicU64::new(0),
                resize_lock: Mutex::new(()),
            }),
        };
        pool.resize(size)?;
        tracing::info!(size = pool.size(), "worker pool started");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Grow by spawning workers, shrink by stopping idle ones. Returns the new size.
    pub fn resize(&self, size: usize) -> StrataResult<usize> {
        let target = resolve_size(size);
        let _guard = self.inner.resize_lock.lock();
        let current = self.size();
        if target > current {
            for _ in current..target {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let worker = Worker::spawn(id, Arc::clone(&self.inner))?;
                self.inner
                    .idle_tx
                    .send(worker)
                    .map_err(|_| StrataError::Internal("worker pool idle channel closed".into()))?;
                self.inner.size.fetch_add(1, Ordering::AcqRel);
            }
        } else {
            for _ in target..current {
                // waits for a busy worker to come back
                let worker = self
                    .inner
                    .idle_rx
                    .recv()
                    .map_err(|_| StrataError::Internal("worker pool idle channel closed".into()))?;
                self.inner.size.fetch_sub(1, Ordering::AcqRel);
                worker.stop();
            }
        }
        if target != current {
            tracing::debug!(from = current, to = target, "worker pool resized");
        }
        Ok(target)
    }

    /// Run `f` on a pinned worker and wait for its result.
    ///
    /// Called from a pinned thread, `f` runs inline: nested work from a job
    /// must not wait for a second worker.
    pub fn submit<T, F>(&self, f: F) -> StrataResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if on_pinned_thread() {
            return Ok(f());
        }
        if !self.is_running() {
            return Err(StrataError::Closed("worker pool"));
        }
        let worker = self
            .inner
            .idle_rx
            .recv()
            .map_err(|_| StrataError::Closed("worker pool"))?;
        self.inner.busy.fetch_add(1, Ordering::AcqRel);

        let (reply_tx, reply_rx) = crossbeam_channel::bounded::<StrataResult<T>>(1);
        let worker_id = worker.id;
        let job: Job = Box::new(move || {
            let out = crash_domain::catch_request("worker_pool", &worker_id.to_string(), f);
            let _ = reply_tx.send(out);
        });
        let sent = worker.tx.send(job);
        let reply = match sent {
            Ok(()) => reply_rx
                .recv()
                .unwrap_or_else(|_| Err(StrataError::Internal("worker dropped the reply".into()))),
            Err(_) => Err(StrataError::Internal("worker is not accepting jobs".into())),
        };

        self.inner.busy.fetch_sub(1, Ordering::AcqRel);
        if self.inner.idle_tx.send(worker).is_err() {
            tracing::warn!(worker = worker_id, "worker pool idle channel closed");
        }
        if matches!(reply, Err(StrataError::Internal(_))) {
            self.inner.total_panics.fetch_add(1, Ordering::Relaxed);
        }
        reply
    }

    /// Stop accepting work and stop every worker once it is idle.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        match self.resize_to_zero() {
            Ok(()) => tracing::info!("worker pool stopped"),
            Err(e) => tracing::warn!(error = %e, "worker pool stop incomplete"),
        }
    }

    fn resize_to_zero(&self) -> StrataResult<()> {
        let _guard = self.inner.resize_lock.lock();
        while self.size() > 0 {
            let worker = self
                .inner
                .idle_rx
                .recv()
                .map_err(|_| StrataError::Internal("worker pool idle channel closed".into()))?;
            self.inner.size.fetch_sub(1, Ordering::AcqRel);
            worker.stop();
        }
        Ok(())
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            size: self.size(),
            idle: self.inner.idle_rx.len(),
            busy: self.inner.busy.load(Ordering::Acquire),
            hard_limit: hard_limit(),
            total_jobs: self.inner.total_jobs.load(Ordering::Relaxed),
            total_panics: self.inner.total_panics.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_runs_on_named_worker_thread() {
        let pool = WorkerPool::start(2).unwrap();
        let name = pool
            .submit(|| std::thread::current().name().map(|s| s.to_string()))
            .unwrap();
        assert!(name.unwrap().starts_with("strata-worker-"));
        assert!(!on_pinned_thread());
        pool.stop();
    }

    #[test]
    fn test_idle_plus_busy_equals_size() {
        let pool = WorkerPool::start(2).unwrap();
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let p = pool.clone();
        let t = std::thread::spawn(move || {
            p.submit(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
            .unwrap()
        });
        started_rx.recv().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.idle + stats.busy, stats.size);
        release_tx.send(()).unwrap();
        t.join().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.idle, stats.size);
        assert_eq!(stats.busy, 0);
        pool.stop();
    }

    #[test]
    fn test_nested_submit_runs_inline() {
        let pool = WorkerPool::start(1).unwrap();
        let inner = pool.clone();
        let v = pool
            .submit(move || inner.submit(|| 7).unwrap())
            .unwrap();
        assert_eq!(v, 7);
        pool.stop();
    }

    #[test]
    fn test_panic_is_reported_and_worker_survives() {
        let pool = WorkerPool::start(1).unwrap();
        let err = pool.submit(|| -> i32 { panic!("boom") }).unwrap_err();
        assert!(matches!(err, StrataError::Internal(_)));
        assert_eq!(pool.submit(|| 1).unwrap(), 1);
        assert_eq!(pool.stats().total_panics, 1);
        pool.stop();
    }

    #[test]
    fn test_resize_clamps_to_hard_limit() {
        let pool = WorkerPool::start(1).unwrap();
        assert_eq!(pool.resize(hard_limit() + 10).unwrap(), hard_limit());
        assert_eq!(pool.stats().idle, hard_limit());
        assert_eq!(pool.resize(1).unwrap(), 1);
        assert_eq!(pool.size(), 1);
        pool.stop();
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_submit_after_stop_fails() {
        let pool = WorkerPool::start(1).unwrap();
        pool.stop();
        let err = pool.submit(|| ()).unwrap_err();
        assert!(matches!(err, StrataError::Closed(_)));
        // a second stop is a no-op
        pool.stop();
    }
}
