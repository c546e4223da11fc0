// SPDX-License-Identifier: AGPL-3.0-only

//! Memory manager integration tests
//!
//! Shared ownership, aliasing, concurrent release and allocator
//! disjointness.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use etsoc_runtime::config::{HOST_STAGING_BASE, REGION_ALIGNMENT};
use etsoc_runtime::{BufferKind, DeviceBuffer, MemoryConfig, MemoryError, MemoryManager};

const MIB: u64 = 1 << 20;

fn manager() -> MemoryManager {
    let config = MemoryConfig {
        region_alignment: REGION_ALIGNMENT,
        dram_base: 0x8000_0000,
        dram_size: 64 * MIB,
        code_region_size: 8 * MIB,
        host_staging_base: HOST_STAGING_BASE,
        host_staging_size: 8 * MIB,
        fail_fast_on_corruption: false,
    };
    MemoryManager::new(0, &config).expect("layout fits")
}

#[test]
fn last_copy_frees_allocation() {
    let mm = manager();
    let buf = mm.malloc_placeholder(MIB).unwrap();
    let ptr = buf.allocation_ptr();

    let copies: Vec<_> = (0..16).map(|_| buf.clone()).collect();
    assert_eq!(buf.ref_count(), 17);

    drop(buf);
    for (i, copy) in copies.into_iter().enumerate() {
        assert!(mm.device_dram().is_ptr_alloced(ptr), "freed early at copy {i}");
        drop(copy);
    }

    assert!(!mm.device_dram().is_ptr_alloced(ptr));
    assert_eq!(mm.device_dram().allocation_count(), 0);
    mm.check_accounting().unwrap();
}

#[test]
fn offset_alias_keeps_allocation_alive() {
    let mm = manager();
    let buf = mm.malloc_constant(4096).unwrap();
    let base = buf.device_address();

    let alias = &buf + 256;
    assert_eq!(alias.device_address(), base + 256);
    assert_eq!(alias.size(), 4096 - 256);
    assert_eq!(alias.kind(), BufferKind::Constant);
    assert!(alias.shares_allocation(&buf));

    drop(buf);
    assert!(mm.device_dram().is_ptr_alloced(alias.allocation_ptr()));

    let nested = alias.offset_by(256).unwrap();
    assert_eq!(nested.device_address(), base + 512);
    assert!(matches!(
        nested.offset_by(4096),
        Err(MemoryError::OutOfBounds { .. })
    ));

    drop(alias);
    drop(nested);
    assert_eq!(mm.device_dram().allocation_count(), 0);
}

#[test]
fn release_reports_last_holder() {
    let mm = manager();
    let buf = mm.malloc_host(4096).unwrap();
    let copy = buf.clone();

    assert!(!buf.release().unwrap());
    assert!(copy.release().unwrap());
    assert_eq!(mm.host_staging().allocation_count(), 0);
}

#[test]
fn live_allocations_never_overlap() {
    let mm = manager();
    let mut live = Vec::new();
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;

    for _ in 0..400 {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;

        if seed % 3 == 0 && !live.is_empty() {
            let index = (seed as usize / 3) % live.len();
            live.swap_remove(index);
        } else {
            let size = 1 + seed % (4 * MIB);
            match mm.malloc_placeholder(size) {
                Ok(buf) => live.push(buf),
                Err(MemoryError::OutOfMemory { .. }) => {}
                Err(e) => panic!("unexpected allocation error: {e}"),
            }
        }

        let mut spans = mm.device_dram().allocations();
        spans.sort_unstable();
        for pair in spans.windows(2) {
            let (a_ptr, a_size) = pair[0];
            let (b_ptr, _) = pair[1];
            assert!(a_ptr + a_size <= b_ptr, "{pair:x?} overlap");
        }
        assert_eq!(spans.len(), live.len());
    }

    drop(live);
    assert_eq!(mm.device_dram().allocated_bytes(), 0);
}

#[test]
fn exhaustion_is_reported_and_recoverable() {
    let mm = manager();
    let code = mm.device_code().size();

    let whole = mm.malloc_code(code).unwrap();
    assert!(matches!(
        mm.malloc_code(1),
        Err(MemoryError::OutOfMemory { .. })
    ));

    drop(whole);
    assert!(mm.malloc_code(code).is_ok());
}

#[test]
fn zero_sized_request_is_rejected() {
    let mm = manager();
    assert!(matches!(
        mm.malloc_placeholder(0),
        Err(MemoryError::InvalidSize { .. })
    ));
}

#[test]
fn regions_are_disjoint() {
    let mm = manager();
    let code = mm.device_code();
    let dram = mm.device_dram();

    assert!(code.base() + code.size() <= dram.base());
    assert!(!dram.is_ptr_in_region(code.base()));
    assert!(mm.host_staging().is_ptr_in_region(HOST_STAGING_BASE));
}

#[test]
fn deallocator_runs_once_under_concurrent_drops() {
    const THREADS: usize = 8;
    const ROUNDS: u64 = 500;

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let buf = DeviceBuffer::new(
        1,
        0x8000_0000,
        MIB,
        BufferKind::Placeholder,
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    let start = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let buf = buf.clone();
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for i in 0..ROUNDS {
                    let copy = buf.clone();
                    let alias = &copy + i;
                    drop(copy);
                    drop(alias);
                }
            })
        })
        .collect();

    // The last handle goes away on whichever worker finishes last.
    drop(buf);
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_sharing_frees_region_once() {
    const THREADS: usize = 8;

    let mm = manager();
    let buf = mm.malloc_placeholder(MIB).unwrap();
    let ptr = buf.allocation_ptr();

    let start = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let buf = buf.clone();
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let copies: Vec<_> = (0..64).map(|_| buf.clone()).collect();
                drop(buf);
                drop(copies);
            })
        })
        .collect();

    drop(buf);
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(!mm.device_dram().is_ptr_alloced(ptr));
    assert_eq!(mm.device_dram().allocation_count(), 0);
    assert_eq!(mm.device_dram().allocated_bytes(), 0);
    mm.check_accounting().unwrap();

    // A second free of the same pointer would have been recorded as corruption.
    let again = mm.malloc_placeholder(MIB).unwrap();
    assert_eq!(again.allocation_ptr(), ptr);
}
