// SPDX-License-Identifier: AGPL-3.0-only

//! Shared-ownership handle to a region allocation
//!
//! A [`DeviceBuffer`] is an `(allocation, offset)` pair. The allocation sits
//! behind an [`Arc`], so cloning a buffer or taking `buf + n` shares one
//! reference count, and the deallocator bound at creation runs exactly once,
//! when the last handle goes away.
//!
//! ```text
//!  buf ──────┐
//!  buf.clone()├──► Arc<Allocation { id, ptr, size, deallocator }>
//!  buf + 64 ─┘          │
//!                       └─ last drop ─► deallocator(ptr)
//! ```
//!
//! Moving a buffer moves the handle; the moved-from binding is gone and never
//! touches the count.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Add;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::error::MemoryError;

/// Releases an allocation given its start pointer
pub type Deallocator = Box<dyn FnOnce(u64) -> Result<(), MemoryError> + Send>;

/// What a buffer holds, and therefore which region backs it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Kernel code in the device code region
    Code,
    /// Data written once by the host (weights, constants)
    Constant,
    /// Scratch or output data filled by the device
    Placeholder,
    /// Host-pinned staging memory for DMA
    HostStaging,
}

struct Allocation {
    buffer_id: u64,
    ptr: u64,
    size: u64,
    kind: BufferKind,
    deallocator: Mutex<Option<Deallocator>>,
}

impl Allocation {
    fn release(&self) -> Option<Result<(), MemoryError>> {
        self.deallocator.lock().take().map(|dealloc| dealloc(self.ptr))
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Some(Err(e)) = self.release() {
            error!(
                "Release of buffer {} ({:?} @ {:#x}) failed: {e}",
                self.buffer_id, self.kind, self.ptr
            );
        }
    }
}

/// Ref-counted view into a region allocation
#[derive(Clone)]
pub struct DeviceBuffer {
    alloc: Arc<Allocation>,
    offset: u64,
}

impl DeviceBuffer {
    /// Wrap a fresh allocation. The reference count starts at one.
    pub fn new(
        buffer_id: u64,
        ptr: u64,
        size: u64,
        kind: BufferKind,
        deallocator: Deallocator,
    ) -> Self {
        Self {
            alloc: Arc::new(Allocation {
                buffer_id,
                ptr,
                size,
                kind,
                deallocator: Mutex::new(Some(deallocator)),
            }),
            offset: 0,
        }
    }

    /// Identity shared by every handle to the same allocation
    pub fn buffer_id(&self) -> u64 {
        self.alloc.buffer_id
    }

    /// Allocation kind
    pub fn kind(&self) -> BufferKind {
        self.alloc.kind
    }

    /// Offset of this view from the allocation start
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes from this view to the end of the allocation
    pub fn size(&self) -> u64 {
        self.alloc.size - self.offset
    }

    /// Start of the underlying allocation
    pub fn allocation_ptr(&self) -> u64 {
        self.alloc.ptr
    }

    /// Address this view points at
    pub fn device_address(&self) -> u64 {
        self.alloc.ptr + self.offset
    }

    /// Live handles sharing the allocation (this one included)
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.alloc)
    }

    /// True if both handles keep the same allocation alive
    pub fn shares_allocation(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.alloc, &other.alloc)
    }

    /// Checked form of `self + n`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfBounds`] if `n` exceeds [`size`](Self::size).
    pub fn offset_by(&self, n: u64) -> Result<Self, MemoryError> {
        if n > self.size() {
            return Err(MemoryError::OutOfBounds {
                offset: n,
                size: self.size(),
            });
        }
        Ok(Self {
            alloc: Arc::clone(&self.alloc),
            offset: self.offset + n,
        })
    }

    /// Drop this handle and, if it was the last one, run the deallocator
    /// and report its outcome.
    ///
    /// Returns `Ok(true)` if the allocation was released, `Ok(false)` if
    /// other handles keep it alive.
    ///
    /// # Errors
    ///
    /// Returns the deallocator's error when the release fails.
    pub fn release(self) -> Result<bool, MemoryError> {
        match Arc::try_unwrap(self.alloc) {
            Ok(alloc) => alloc.release().map_or(Ok(true), |r| r.map(|()| true)),
            Err(_shared) => Ok(false),
        }
    }
}

impl Add<u64> for DeviceBuffer {
    type Output = Self;

    /// # Panics
    ///
    /// Panics if `n` exceeds the remaining size.
    fn add(self, n: u64) -> Self {
        let size = self.size();
        assert!(n <= size, "offset {n} out of bounds for buffer of {size} bytes");
        Self {
            offset: self.offset + n,
            ..self
        }
    }
}

impl Add<u64> for &DeviceBuffer {
    type Output = DeviceBuffer;

    /// # Panics
    ///
    /// Panics if `n` exceeds the remaining size.
    fn add(self, n: u64) -> DeviceBuffer {
        self.clone() + n
    }
}

impl PartialEq for DeviceBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.buffer_id() == other.buffer_id()
    }
}

impl Eq for DeviceBuffer {}

impl PartialOrd for DeviceBuffer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeviceBuffer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.buffer_id().cmp(&other.buffer_id())
    }
}

impl Hash for DeviceBuffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.buffer_id().hash(state);
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("buffer_id", &self.buffer_id())
            .field("kind", &self.kind())
            .field("address", &format_args!("{:#x}", self.device_address()))
            .field("size", &self.size())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn counted(id: u64, calls: &Arc<AtomicUsize>) -> DeviceBuffer {
        let calls = Arc::clone(calls);
        DeviceBuffer::new(
            id,
            0x1000_0000,
            4096,
            BufferKind::Constant,
            Box::new(move |_| {
                calls.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }),
        )
    }

    #[test]
    fn offset_view_reports_remaining_size() {
        let calls = Arc::new(AtomicUsize::new(0));
        let buf = counted(1, &calls);
        let view = &buf + 1024;
        assert_eq!(view.size(), 3072);
        assert_eq!(view.device_address(), 0x1000_0400);
        assert_eq!((&view + 1024).offset(), 2048);
        assert!(view.shares_allocation(&buf));
        assert_eq!(buf.ref_count(), 2);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn offset_past_end_panics() {
        let calls = Arc::new(AtomicUsize::new(0));
        let _ = counted(1, &calls) + 4097;
    }

    #[test]
    fn checked_offset() {
        let calls = Arc::new(AtomicUsize::new(0));
        let buf = counted(1, &calls);
        assert!(buf.offset_by(4096).is_ok());
        assert_eq!(
            buf.offset_by(4097).unwrap_err(),
            MemoryError::OutOfBounds {
                offset: 4097,
                size: 4096
            }
        );
    }

    #[test]
    fn identity_ignores_offset() {
        let calls = Arc::new(AtomicUsize::new(0));
        let a = counted(1, &calls);
        let a_view = &a + 8;
        let b = counted(2, &calls);
        assert_eq!(a, a_view);
        assert!(a < b);

        let set: HashSet<_> = [a.clone(), a_view.clone(), b.clone()].into_iter().collect();
        assert_eq!(set.len(), 2);
        let ordered: BTreeSet<_> = [b, a_view, a].into_iter().collect();
        assert_eq!(ordered.len(), 2);
    }

    #[test]
    fn release_reports_last_holder() {
        let calls = Arc::new(AtomicUsize::new(0));
        let a = counted(1, &calls);
        let b = a.clone();
        assert_eq!(a.release(), Ok(false));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(b.release(), Ok(true));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn release_surfaces_deallocator_failure() {
        let buf = DeviceBuffer::new(
            9,
            0x2000,
            64,
            BufferKind::Placeholder,
            Box::new(|ptr| {
                Err(MemoryError::NotAllocated {
                    region: "test",
                    ptr,
                })
            }),
        );
        assert!(matches!(
            buf.release(),
            Err(MemoryError::NotAllocated { ptr: 0x2000, .. })
        ));
    }
}
