//! Bounded worker pool for evaluator jobs
//!
//! A permit is acquired before a job is spawned, so a dispatch loop that
//! outruns the workers waits instead of queueing unbounded work.

use crate::error::{NasError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub workers: usize,
    pub active: usize,
    /// Highest number of jobs ever running at once
    pub peak: usize,
}

#[derive(Debug)]
struct PoolInner {
    workers: usize,
    semaphore: Arc<Semaphore>,
    free_workers: Mutex<Vec<usize>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

/// Held by a running job; releases its worker slot on drop, also when the
/// job panics
struct Occupancy {
    inner: Arc<PoolInner>,
    worker: usize,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Occupancy {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
        self.inner.free_workers.lock().push(self.worker);
    }
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(NasError::Config("worker pool needs at least one worker".into()));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                workers,
                semaphore: Arc::new(Semaphore::new(workers)),
                free_workers: Mutex::new((0..workers).rev().collect()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        })
    }

    /// Wait for a free worker, then run `job` on the blocking thread pool.
    /// `job` receives the worker index it occupies.
    pub async fn spawn<F, T>(&self, job: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce(usize) -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| NasError::Runtime(format!("worker pool closed: {}", e)))?;
        let worker = self
            .inner
            .free_workers
            .lock()
            .pop()
            .ok_or_else(|| NasError::Runtime("permit granted without a free worker".into()))?;
        let now = self.inner.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak.fetch_max(now, Ordering::AcqRel);

        let occupancy = Occupancy {
            inner: Arc::clone(&self.inner),
            worker,
            _permit: permit,
        };
        Ok(tokio::task::spawn_blocking(move || {
            let occupancy = occupancy;
            job(occupancy.worker)
        }))
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.inner.workers,
            active: self.inner.active.load(Ordering::Acquire),
            peak: self.inner.peak.load(Ordering::Acquire),
        }
    }
}
