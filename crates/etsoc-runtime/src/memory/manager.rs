// SPDX-License-Identifier: AGPL-3.0-only

//! Per-device memory manager
//!
//! | Region | Backs | Entry point |
//! |--------|-------|-------------|
//! | `device_code` | kernel code | [`MemoryManager::malloc_code`] |
//! | `device_dram` | constants and placeholders | [`MemoryManager::malloc_constant`], [`MemoryManager::malloc_placeholder`] |
//! | `host_staging` | host-pinned DMA staging | [`MemoryManager::malloc_host`] |
//!
//! Every entry point is `alloc` + [`DeviceBuffer::new`] with a deallocator
//! bound to the owning region. A failed release means the allocation map no
//! longer matches the buffers handed out; it is recorded and surfaced by
//! [`MemoryManager::check_accounting`], or aborts the process when
//! `fail_fast_on_corruption` is set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::buffer::{BufferKind, Deallocator, DeviceBuffer};
use super::region::MemRegion;
use crate::config::MemoryConfig;
use crate::error::MemoryError;

#[derive(Debug, Default)]
struct Accounting {
    failures: Mutex<Vec<MemoryError>>,
}

impl Accounting {
    fn record(&self, err: &MemoryError, fail_fast: bool) {
        error!("Buffer accounting corrupted: {err}");
        if fail_fast {
            std::process::abort();
        }
        self.failures.lock().push(err.clone());
    }
}

/// Owns the regions of one device and hands out [`DeviceBuffer`]s
#[derive(Debug)]
pub struct MemoryManager {
    device: usize,
    host_staging: Arc<MemRegion>,
    device_dram: Arc<MemRegion>,
    device_code: Arc<MemRegion>,
    next_buffer_id: AtomicU64,
    accounting: Arc<Accounting>,
    fail_fast: bool,
}

impl MemoryManager {
    /// Build the three regions described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidSize`] if the code window does not leave
    /// room for data, or a region cannot be formed.
    pub fn new(device: usize, config: &MemoryConfig) -> Result<Self, MemoryError> {
        if config.code_region_size >= config.dram_size {
            return Err(MemoryError::InvalidSize {
                size: config.code_region_size,
            });
        }
        let align = config.region_alignment;

        let device_code = MemRegion::new("device_code", config.dram_base, config.code_region_size, align)?;
        let data_base = device_code.base() + device_code.size();
        let data_size = config.dram_size - (data_base - config.dram_base);
        let device_dram = MemRegion::new("device_dram", data_base, data_size, align)?;
        let host_staging = MemRegion::new(
            "host_staging",
            config.host_staging_base,
            config.host_staging_size,
            align,
        )?;

        info!(
            "Device {device} memory: code {} MiB, data {} MiB, staging {} MiB",
            device_code.size() >> 20,
            device_dram.size() >> 20,
            host_staging.size() >> 20
        );

        Ok(Self {
            device,
            host_staging: Arc::new(host_staging),
            device_dram: Arc::new(device_dram),
            device_code: Arc::new(device_code),
            next_buffer_id: AtomicU64::new(1),
            accounting: Arc::default(),
            fail_fast: config.fail_fast_on_corruption,
        })
    }

    /// Allocate kernel code in the code region.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError`] if the region cannot satisfy the request.
    pub fn malloc_code(&self, size: u64) -> Result<DeviceBuffer, MemoryError> {
        self.malloc(&self.device_code, size, BufferKind::Code)
    }

    /// Allocate host-initialised data in device DRAM.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError`] if the region cannot satisfy the request.
    pub fn malloc_constant(&self, size: u64) -> Result<DeviceBuffer, MemoryError> {
        self.malloc(&self.device_dram, size, BufferKind::Constant)
    }

    /// Allocate device-filled data in device DRAM.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError`] if the region cannot satisfy the request.
    pub fn malloc_placeholder(&self, size: u64) -> Result<DeviceBuffer, MemoryError> {
        self.malloc(&self.device_dram, size, BufferKind::Placeholder)
    }

    /// Allocate host-pinned staging memory.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError`] if the region cannot satisfy the request.
    pub fn malloc_host(&self, size: u64) -> Result<DeviceBuffer, MemoryError> {
        self.malloc(&self.host_staging, size, BufferKind::HostStaging)
    }

    fn malloc(
        &self,
        region: &Arc<MemRegion>,
        size: u64,
        kind: BufferKind,
    ) -> Result<DeviceBuffer, MemoryError> {
        let ptr = region.alloc(size)?;
        let buffer_id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Device {}: buffer {buffer_id} {kind:?} {ptr:#x}+{size:#x} in {}",
            self.device,
            region.name()
        );
        Ok(DeviceBuffer::new(
            buffer_id,
            ptr,
            size,
            kind,
            self.deallocator(region),
        ))
    }

    fn deallocator(&self, region: &Arc<MemRegion>) -> Deallocator {
        let region = Arc::clone(region);
        let accounting = Arc::clone(&self.accounting);
        let fail_fast = self.fail_fast;
        Box::new(move |ptr| {
            region.free(ptr).map_err(|e| {
                accounting.record(&e, fail_fast);
                e
            })
        })
    }

    /// Surface any failed release since construction.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::AccountingCorruption`] if a deallocator failed.
    pub fn check_accounting(&self) -> Result<(), MemoryError> {
        let failures = self.accounting.failures.lock();
        match failures.last() {
            None => Ok(()),
            Some(last) => Err(MemoryError::AccountingCorruption {
                failures: failures.len(),
                last: last.to_string(),
            }),
        }
    }

    /// Region backing buffers of `kind`
    pub fn region(&self, kind: BufferKind) -> &MemRegion {
        match kind {
            BufferKind::Code => &self.device_code,
            BufferKind::Constant | BufferKind::Placeholder => &self.device_dram,
            BufferKind::HostStaging => &self.host_staging,
        }
    }

    /// Host-pinned staging region
    pub fn host_staging(&self) -> &MemRegion {
        &self.host_staging
    }

    /// Device DRAM data region
    pub fn device_dram(&self) -> &MemRegion {
        &self.device_dram
    }

    /// Device code region
    pub fn device_code(&self) -> &MemRegion {
        &self.device_code
    }

    /// Device index these regions belong to
    pub const fn device(&self) -> usize {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    fn manager() -> MemoryManager {
        MemoryManager::new(0, &MemoryConfig::minimal()).unwrap()
    }

    #[test]
    fn regions_split_dram() {
        let mm = manager();
        assert_eq!(mm.device_code().base(), 0x8000_0000);
        assert_eq!(mm.device_code().size(), 4 * MIB);
        assert_eq!(mm.device_dram().base(), 0x8000_0000 + 4 * MIB);
        assert_eq!(mm.device_dram().size(), 12 * MIB);
        assert_eq!(mm.host_staging().size(), 4 * MIB);
    }

    #[test]
    fn kinds_land_in_their_regions() {
        let mm = manager();
        let code = mm.malloc_code(100).unwrap();
        let data = mm.malloc_constant(100).unwrap();
        let scratch = mm.malloc_placeholder(100).unwrap();
        let host = mm.malloc_host(100).unwrap();

        assert!(mm.device_code().is_ptr_alloced(code.device_address()));
        assert!(mm.device_dram().is_ptr_alloced(data.device_address()));
        assert!(mm.device_dram().is_ptr_alloced(scratch.device_address()));
        assert!(mm.host_staging().is_ptr_alloced(host.device_address()));
        assert_eq!(data.size(), 100);
        assert_ne!(code.buffer_id(), data.buffer_id());
    }

    #[test]
    fn last_drop_frees_region_slot() {
        let mm = manager();
        let buf = mm.malloc_constant(MIB).unwrap();
        let ptr = buf.device_address();
        let copy = buf.clone();
        let view = &buf + 128;
        drop(buf);
        drop(copy);
        assert!(mm.device_dram().is_ptr_alloced(ptr));
        drop(view);
        assert!(!mm.device_dram().is_ptr_alloced(ptr));
        assert!(mm.check_accounting().is_ok());
    }

    #[test]
    fn out_of_memory_is_an_error() {
        let mm = manager();
        let _all = mm.malloc_code(4 * MIB).unwrap();
        assert!(matches!(
            mm.malloc_code(1),
            Err(MemoryError::OutOfMemory {
                region: "device_code",
                ..
            })
        ));
    }

    #[test]
    fn failed_release_is_recorded() {
        let mm = manager();
        let buf = mm.malloc_placeholder(MIB).unwrap();
        // Free behind the buffer's back so its deallocator finds nothing.
        mm.device_dram().free(buf.device_address()).unwrap();
        assert!(buf.release().is_err());
        assert!(matches!(
            mm.check_accounting(),
            Err(MemoryError::AccountingCorruption { failures: 1, .. })
        ));
    }

    #[test]
    fn code_window_must_leave_data() {
        let mut config = MemoryConfig::minimal();
        config.code_region_size = config.dram_size;
        assert!(MemoryManager::new(0, &config).is_err());
    }
}
