// SPDX-License-Identifier: AGPL-3.0-only

//! Region allocation and shared device buffers

mod buffer;
mod manager;
mod region;

pub use buffer::{BufferKind, Deallocator, DeviceBuffer};
pub use manager::MemoryManager;
pub use region::MemRegion;
