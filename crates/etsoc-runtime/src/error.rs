// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for ETSoC runtime operations

use std::path::PathBuf;

use etsoc_api::{ApiVersion, WireError};
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, EtError>;

/// Errors that can occur while driving a device
#[derive(Debug, Error)]
pub enum EtError {
    /// Device node not found at the expected path
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// No ETSoC devices detected on the system
    #[error("No ETSoC devices detected")]
    NoDevicesFound,

    /// Device index out of range
    #[error("Device index {index} out of range (have {count} devices)")]
    InvalidIndex {
        /// Requested index
        index: usize,
        /// Number of available devices
        count: usize,
    },

    /// Virtual queue index out of range
    #[error("Queue {queue} out of range for device {device} (have {count})")]
    InvalidQueue {
        /// Device index
        device: usize,
        /// Requested queue
        queue: usize,
        /// Queues the device exposes
        count: usize,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Transport could not move a frame
    #[error("Transport error: {reason}")]
    Transport {
        /// Reason for failure
        reason: String,
    },

    /// Frame could not be encoded or decoded
    #[error("Protocol error: {source}")]
    Protocol {
        /// Underlying wire error
        #[from]
        source: WireError,
    },

    /// Region allocator or buffer accounting failure
    #[error("Memory error: {source}")]
    Memory {
        /// Underlying allocation error
        #[from]
        source: MemoryError,
    },

    /// Caller-assigned tag is still outstanding
    #[error("Tag {tag_id} is already pending")]
    TagInUse {
        /// Requested tag
        tag_id: u16,
    },

    /// Every tag value is held by a pending command
    #[error("No free tag: {pending} commands outstanding")]
    NoFreeTag {
        /// Commands currently pending
        pending: usize,
    },

    /// Firmware speaks an API this host cannot use
    #[error("Device API {device} is incompatible with host API {host}")]
    IncompatibleDevice {
        /// Version reported by firmware
        device: ApiVersion,
        /// Version this host was built against
        host: ApiVersion,
    },

    /// Device reported a failure status for a command
    #[error("Device returned status {status} for msg_id {msg_id}")]
    DeviceStatus {
        /// Message id of the response
        msg_id: u16,
        /// Raw status word
        status: i64,
    },

    /// Component is in the wrong state for the operation
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Operation timeout
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },
}

impl EtError {
    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a timeout error
    #[allow(clippy::cast_possible_truncation)]
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Errors from the region allocator and buffer accounting
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// No gap large enough for the request
    #[error("Out of memory in {region}: requested {requested} bytes, {free} free")]
    OutOfMemory {
        /// Region name
        region: &'static str,
        /// Requested size after alignment
        requested: u64,
        /// Bytes not allocated (possibly fragmented)
        free: u64,
    },

    /// Pointer is not a live allocation of the region
    #[error("Pointer {ptr:#x} is not allocated in {region}")]
    NotAllocated {
        /// Region name
        region: &'static str,
        /// Pointer passed to free
        ptr: u64,
    },

    /// Zero-sized or overflowing request
    #[error("Invalid allocation size {size}")]
    InvalidSize {
        /// Requested size
        size: u64,
    },

    /// Offset past the end of a buffer
    #[error("Offset {offset} out of bounds for buffer of {size} bytes")]
    OutOfBounds {
        /// Requested offset
        offset: u64,
        /// Remaining buffer size
        size: u64,
    },

    /// A deallocator failed: region bookkeeping no longer matches live buffers
    #[error("Accounting corruption: {failures} failed release(s), last: {last}")]
    AccountingCorruption {
        /// Number of failed releases recorded
        failures: usize,
        /// Most recent failure
        last: String,
    },
}
