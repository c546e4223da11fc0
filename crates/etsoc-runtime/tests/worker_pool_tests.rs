// SPDX-License-Identifier: AGPL-3.0-only

//! Worker pool integration tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use etsoc_runtime::{WorkerPool, WorkerPoolConfig};

#[test]
fn drain_runs_every_task() {
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let pool = WorkerPool::new(WorkerPoolConfig::fixed(4)).unwrap();
        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
    }
    assert_eq!(counter.load(Ordering::Relaxed), 1000);
}

#[test]
fn discard_drops_unstarted_tasks() {
    let queued_ran = Arc::new(AtomicUsize::new(0));
    let running_done = Arc::new(AtomicBool::new(false));
    let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

    let pool = WorkerPool::new(WorkerPoolConfig::fixed(1).with_drain_on_shutdown(false)).unwrap();

    let done = Arc::clone(&running_done);
    pool.submit(move || {
        started_tx.send(()).unwrap();
        // Unblocked once every queued task (and its sender) is discarded.
        let released = release_rx.recv_timeout(Duration::from_secs(10));
        assert!(released.is_err(), "nothing sends on the release channel");
        done.store(true, Ordering::SeqCst);
    });
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("first task should start");

    for _ in 0..999 {
        let ran = Arc::clone(&queued_ran);
        let release = release_tx.clone();
        pool.submit(move || {
            let _release = release;
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    drop(release_tx);
    assert_eq!(pool.queued(), 999);

    drop(pool);

    assert!(running_done.load(Ordering::SeqCst), "running task must finish");
    assert_eq!(queued_ran.load(Ordering::SeqCst), 0);
}

#[test]
fn panicking_task_is_counted_not_fatal() {
    let pool = WorkerPool::new(WorkerPoolConfig::fixed(2)).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    pool.submit(|| panic!("task failure"));
    let r = Arc::clone(&ran);
    pool.submit(move || {
        r.fetch_add(1, Ordering::Relaxed);
    });
    pool.block_until_drained();

    assert_eq!(pool.failed_tasks(), 1);
    assert_eq!(ran.load(Ordering::Relaxed), 1);
    assert_eq!(pool.worker_count(), 2);
}

#[test]
fn bounded_pool_grows_under_load() {
    let pool = WorkerPool::new(WorkerPoolConfig::fixed(1).with_max_workers(4)).unwrap();
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

    for _ in 0..8 {
        let rx = release_rx.clone();
        pool.submit(move || {
            let _ = rx.recv_timeout(Duration::from_secs(5));
        });
    }

    assert_eq!(pool.worker_count(), 4);
    drop(release_tx);
    pool.block_until_drained();
    assert_eq!(pool.completed_tasks(), 8);
}
