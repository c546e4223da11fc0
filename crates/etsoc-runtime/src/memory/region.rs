// SPDX-License-Identifier: AGPL-3.0-only

//! Contiguous address range with an explicit allocation map
//!
//! Every live allocation is recorded as `ptr -> size` in an ordered map.
//! Sizes are rounded up to the region alignment, and the first gap large
//! enough for the rounded size wins. Entries are pairwise disjoint and lie
//! inside `[base, base + size)`.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::MemoryError;

/// Round `value` up to a multiple of `alignment` (a power of two).
pub(crate) const fn align_up(value: u64, alignment: u64) -> Option<u64> {
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

/// One address window and the allocations carved out of it
#[derive(Debug)]
pub struct MemRegion {
    name: &'static str,
    base: u64,
    size: u64,
    alignment: u64,
    allocated: Mutex<BTreeMap<u64, u64>>,
}

impl MemRegion {
    /// Create an empty region.
    ///
    /// `base` is rounded up and `size` rounded down to `alignment`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidSize`] if `alignment` is not a power of
    /// two or nothing usable remains after rounding.
    pub fn new(name: &'static str, base: u64, size: u64, alignment: u64) -> Result<Self, MemoryError> {
        if !alignment.is_power_of_two() {
            return Err(MemoryError::InvalidSize { size: alignment });
        }
        let aligned_base = align_up(base, alignment).ok_or(MemoryError::InvalidSize { size })?;
        let usable = size
            .saturating_sub(aligned_base - base)
            / alignment
            * alignment;
        if usable == 0 || aligned_base.checked_add(usable).is_none() {
            return Err(MemoryError::InvalidSize { size });
        }

        debug!("Region {name}: {aligned_base:#x}+{usable:#x} (alignment {alignment:#x})");

        Ok(Self {
            name,
            base: aligned_base,
            size: usable,
            alignment,
            allocated: Mutex::new(BTreeMap::new()),
        })
    }

    /// Carve out `size` bytes (rounded up to the alignment).
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidSize`] for zero, and
    /// [`MemoryError::OutOfMemory`] when no gap fits.
    pub fn alloc(&self, size: u64) -> Result<u64, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize { size });
        }
        let rounded = align_up(size, self.alignment).ok_or(MemoryError::InvalidSize { size })?;

        let mut allocated = self.allocated.lock();
        let end = self.base + self.size;
        let mut cursor = self.base;
        let mut found = None;
        for (&ptr, &len) in allocated.iter() {
            if ptr - cursor >= rounded {
                found = Some(cursor);
                break;
            }
            cursor = ptr + len;
        }
        if found.is_none() && end - cursor >= rounded {
            found = Some(cursor);
        }

        let Some(ptr) = found else {
            let used: u64 = allocated.values().sum();
            return Err(MemoryError::OutOfMemory {
                region: self.name,
                requested: rounded,
                free: self.size - used,
            });
        };

        allocated.insert(ptr, rounded);
        trace!("{}: alloc {ptr:#x}+{rounded:#x}", self.name);
        Ok(ptr)
    }

    /// Release an allocation by its start pointer.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::NotAllocated`] if `ptr` is not the start of a
    /// live allocation.
    pub fn free(&self, ptr: u64) -> Result<(), MemoryError> {
        match self.allocated.lock().remove(&ptr) {
            Some(len) => {
                trace!("{}: free {ptr:#x}+{len:#x}", self.name);
                Ok(())
            }
            None => Err(MemoryError::NotAllocated {
                region: self.name,
                ptr,
            }),
        }
    }

    /// True if `ptr` lies inside the region window
    pub fn is_ptr_in_region(&self, ptr: u64) -> bool {
        ptr >= self.base && ptr - self.base < self.size
    }

    /// True if `ptr` is the start of a live allocation
    pub fn is_ptr_alloced(&self, ptr: u64) -> bool {
        self.allocated.lock().contains_key(&ptr)
    }

    /// Rounded size of the allocation starting at `ptr`
    pub fn allocation_size(&self, ptr: u64) -> Option<u64> {
        self.allocated.lock().get(&ptr).copied()
    }

    /// Bytes held by live allocations
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.lock().values().sum()
    }

    /// Bytes not held by any allocation (may be fragmented)
    pub fn free_bytes(&self) -> u64 {
        self.size - self.allocated_bytes()
    }

    /// Number of live allocations
    pub fn allocation_count(&self) -> usize {
        self.allocated.lock().len()
    }

    /// Snapshot of live allocations as `(ptr, size)`, ordered by address
    pub fn allocations(&self) -> Vec<(u64, u64)> {
        self.allocated.lock().iter().map(|(&p, &s)| (p, s)).collect()
    }

    /// Region name used in logs and errors
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// First usable address
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Usable bytes
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Allocation granule
    pub const fn alignment(&self) -> u64 {
        self.alignment
    }
}
