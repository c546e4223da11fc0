// SPDX-License-Identifier: AGPL-3.0-only

//! Transport abstraction for device mailboxes
//!
//! A transport moves opaque, already-encoded frames to and from a device's
//! virtual queues. It knows nothing about tags or message kinds; correlation
//! lives in [`crate::Dispatcher`].
//!
//! The interface is split by capability so a component can depend on only
//! what it uses:
//!
//! | Trait | Used by |
//! |-------|---------|
//! | [`CommandSink`] | dispatch loop |
//! | [`ResponseSource`] | receive loop |
//! | [`DeviceQuery`] | memory manager, session setup |
//!
//! [`DeviceTransport`] is implemented for anything that has all three.

use std::fmt::{self, Debug};
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;

/// Queue a frame travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtualQueue {
    /// Device-ops submission/completion queue pair
    Ops(usize),
    /// Service processor management queue
    Management,
}

impl fmt::Display for VirtualQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ops(index) => write!(f, "ops[{index}]"),
            Self::Management => write!(f, "mgmt"),
        }
    }
}

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Kernel character devices (`/dev/et*_ops`, `/dev/et*_mgmt`)
    Node,
    /// In-process device model
    Emulated,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => write!(f, "Node"),
            Self::Emulated => write!(f, "Emulated"),
        }
    }
}

/// Host-to-device half of a transport
pub trait CommandSink: Send + Sync {
    /// Push one complete command frame onto a queue.
    ///
    /// # Errors
    ///
    /// Returns error if the frame could not be handed to the device
    /// (queue full, device gone, short write).
    fn send_command(&self, device: usize, queue: VirtualQueue, frame: &[u8]) -> Result<()>;
}

/// Device-to-host half of a transport
pub trait ResponseSource: Send + Sync {
    /// Wait up to `timeout` for one response or event frame.
    ///
    /// Returns `Ok(None)` when the timeout expires without a frame.
    ///
    /// # Errors
    ///
    /// Returns error if the device is unreachable.
    fn receive_response(
        &self,
        device: usize,
        queue: VirtualQueue,
        timeout: Duration,
    ) -> Result<Option<Bytes>>;
}

/// Synchronous, side-effect-free device queries
pub trait DeviceQuery: Send + Sync {
    /// Number of devices this transport reaches
    fn devices_count(&self) -> usize;

    /// Number of ops virtual queues on `device`
    ///
    /// # Errors
    ///
    /// Returns error if `device` is out of range.
    fn virtual_queues_count(&self, device: usize) -> Result<usize>;

    /// Required alignment for DMA buffers
    fn dma_alignment(&self) -> usize;

    /// Bytes of device DRAM usable by the host
    fn dram_size(&self) -> u64;

    /// Device address of the host-usable DRAM window
    fn dram_base_address(&self) -> u64;

    /// Transport type for logging
    fn transport_type(&self) -> TransportType;
}

/// Full transport: send, receive and query
pub trait DeviceTransport: CommandSink + ResponseSource + DeviceQuery + Debug {}

impl<T> DeviceTransport for T where T: CommandSink + ResponseSource + DeviceQuery + Debug {}
