// SPDX-License-Identifier: AGPL-3.0-only

//! Host-side task executor
//!
//! ```text
//! submit ─► queue ─► idle worker ─► task()
//!              │
//!              └─ no idle worker + growth allows ─► spawn worker
//! ```
//!
//! A panicking task is caught, logged and counted; it never takes the worker
//! or the process down. On drop the pool either drains the queue or discards
//! tasks that have not started, then joins every worker.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::config::{GrowthPolicy, WorkerPoolConfig};
use crate::error::{EtError, Result};

/// One-shot unit of work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Task>,
    idle: usize,
    running: usize,
    workers: usize,
    shutting_down: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    drained: Condvar,
    failed: AtomicUsize,
    completed: AtomicUsize,
}

/// Thread pool with optional bounded growth
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    config: WorkerPoolConfig,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkerPool")
            .field("workers", &state.workers)
            .field("queued", &state.queue.len())
            .field("running", &state.running)
            .field("config", &self.config)
            .finish()
    }
}

impl WorkerPool {
    /// Start a pool with `config.initial_workers` threads.
    ///
    /// # Errors
    ///
    /// Returns error if the pool could never run a task (no workers and no
    /// growth) or if a worker thread cannot be spawned.
    pub fn new(config: WorkerPoolConfig) -> Result<Self> {
        let can_grow = matches!(config.growth, GrowthPolicy::Bounded { max_workers } if max_workers > 0);
        if config.initial_workers == 0 && !can_grow {
            return Err(EtError::invalid_state(
                "worker pool needs at least one worker or a growth policy",
            ));
        }

        let pool = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                work_available: Condvar::new(),
                drained: Condvar::new(),
                failed: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            }),
            handles: Mutex::new(Vec::with_capacity(config.initial_workers)),
            config,
        };

        for _ in 0..pool.config.initial_workers {
            pool.shared.state.lock().workers += 1;
            pool.spawn_worker()?;
        }

        info!(
            "Worker pool started: {} workers, growth {:?}, drain_on_shutdown={}",
            pool.config.initial_workers, pool.config.growth, pool.config.drain_on_shutdown
        );
        Ok(pool)
    }

    /// Queue a task, growing the pool if every worker is busy and the
    /// growth policy allows it.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let grow = {
            let mut state = self.shared.state.lock();
            // Idle workers already owed a wake-up for queued tasks are not free.
            let free_worker = state.idle > state.queue.len();
            state.queue.push_back(Box::new(task));
            let grow = !free_worker
                && match self.config.growth {
                    GrowthPolicy::Fixed => false,
                    GrowthPolicy::Bounded { max_workers } => state.workers < max_workers,
                };
            if grow {
                state.workers += 1;
            }
            grow
        };

        self.shared.work_available.notify_one();

        if grow {
            if let Err(e) = self.spawn_worker() {
                warn!("Failed to grow worker pool: {e}");
            }
        }
    }

    /// Block until the queue is empty and no task is running.
    pub fn block_until_drained(&self) {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.running > 0 {
            self.shared.drained.wait(&mut state);
        }
    }

    /// Live worker threads
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().workers
    }

    /// Tasks waiting for a worker
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Tasks currently executing
    pub fn running(&self) -> usize {
        self.shared.state.lock().running
    }

    /// Tasks that panicked
    pub fn failed_tasks(&self) -> usize {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Tasks that returned normally
    pub fn completed_tasks(&self) -> usize {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Spawn one worker; the caller has already counted it in `workers`.
    fn spawn_worker(&self) -> Result<()> {
        let mut handles = self.handles.lock();
        let id = handles.len();
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("etsoc-worker-{id}"))
            .spawn(move || worker_loop(&shared, id));

        match spawned {
            Ok(handle) => {
                handles.push(handle);
                debug!("Spawned worker {id}");
                Ok(())
            }
            Err(e) => {
                self.shared.state.lock().workers -= 1;
                Err(e.into())
            }
        }
    }
}

fn worker_loop(shared: &Shared, id: usize) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    state.running += 1;
                    break task;
                }
                if state.shutting_down {
                    state.workers -= 1;
                    trace!("Worker {id} exiting");
                    return;
                }
                state.idle += 1;
                shared.work_available.wait(&mut state);
                state.idle -= 1;
            }
        };

        match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(()) => {
                shared.completed.fetch_add(1, Ordering::AcqRel);
            }
            Err(payload) => {
                shared.failed.fetch_add(1, Ordering::AcqRel);
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                warn!("Task panicked on worker {id}: {msg}");
            }
        }

        let mut state = shared.state.lock();
        state.running -= 1;
        if state.queue.is_empty() && state.running == 0 {
            shared.drained.notify_all();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if !self.config.drain_on_shutdown {
                let discarded = state.queue.len();
                state.queue.clear();
                if discarded > 0 {
                    info!("Worker pool discarding {discarded} unstarted task(s)");
                }
            }
            state.shutting_down = true;
        }
        self.shared.work_available.notify_all();

        for handle in self.handles.get_mut().drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread terminated abnormally");
            }
        }

        info!(
            "Worker pool stopped: {} completed, {} failed",
            self.completed_tasks(),
            self.failed_tasks()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn runs_submitted_tasks() {
        let pool = WorkerPool::new(WorkerPoolConfig::fixed(2)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = Arc::clone(&counter);
            pool.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.block_until_drained();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(pool.completed_tasks(), 100);
    }

    #[test]
    fn zero_workers_without_growth_is_rejected() {
        assert!(WorkerPool::new(WorkerPoolConfig::fixed(0)).is_err());
        assert!(WorkerPool::new(WorkerPoolConfig::fixed(0).with_max_workers(2)).is_ok());
    }

    #[test]
    fn grows_under_contention_up_to_bound() {
        let pool = WorkerPool::new(WorkerPoolConfig::fixed(1).with_max_workers(3)).unwrap();
        let release = Arc::new(AtomicBool::new(false));
        for _ in 0..10 {
            let r = Arc::clone(&release);
            pool.submit(move || {
                while !r.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
            });
        }
        assert_eq!(pool.worker_count(), 3);
        release.store(true, Ordering::Release);
        pool.block_until_drained();
    }

    #[test]
    fn fixed_pool_never_grows() {
        let pool = WorkerPool::new(WorkerPoolConfig::fixed(2)).unwrap();
        for _ in 0..20 {
            pool.submit(|| thread::sleep(Duration::from_millis(1)));
        }
        assert_eq!(pool.worker_count(), 2);
        pool.block_until_drained();
    }

    #[test]
    fn panicking_task_is_counted_not_fatal() {
        let pool = WorkerPool::new(WorkerPoolConfig::fixed(1)).unwrap();
        pool.submit(|| panic!("boom"));
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        pool.submit(move || r.store(true, Ordering::SeqCst));
        pool.block_until_drained();
        assert_eq!(pool.failed_tasks(), 1);
        assert!(ran.load(Ordering::SeqCst));
    }
}
