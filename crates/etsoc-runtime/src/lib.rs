// SPDX-License-Identifier: AGPL-3.0-only

//! Host-side runtime for ETSoC-1 accelerator cards.
//!
//! Turns the card's mailbox protocol (one command frame in, one response
//! frame out, matched by tag) into a submit-and-wait API, manages device
//! memory through reference-counted buffers, and refuses protocol traffic
//! until firmware and host agree on the API version.
//!
//! # Layering
//!
//! ```text
//!   DeviceSession ── negotiate() gates everything below the line
//!   ─────────────────────────────────────────────────────────────
//!   Dispatcher (tags, pending table, tx/rx threads)
//!     └─ CommandQueue ── DeviceTransport
//!                          ├─ NodeTransport    /dev/et{N}_ops, /dev/et{N}_mgmt
//!                          └─ EmulatedDevice   in-process firmware model
//!
//!   MemoryManager ── MemRegion (code | data | host staging) ── DeviceBuffer
//!   WorkerPool    ── host-side work items
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use etsoc_runtime::{DeviceSession, EmulatedDevice, SessionConfig};
//!
//! # fn main() -> etsoc_runtime::Result<()> {
//! let session = DeviceSession::open(Arc::new(EmulatedDevice::new()), SessionConfig::default())?;
//! session.negotiate()?;
//!
//! assert_eq!(session.echo(0xDEAD_BEEF)?, 0xDEAD_BEEF);
//!
//! let host = session.memory().malloc_host(4096)?;
//! let dram = session.memory().malloc_placeholder(4096)?;
//! let rsp = session.dma_write(&host, &dram, 4096)?.wait();
//! assert!(rsp.is_ok());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
mod command_queue;
pub mod config;
mod discovery;
pub mod dispatcher;
mod error;
pub mod memory;
mod session;
pub mod transport;
pub mod version;
mod worker_pool;

pub use backends::{DeviceGeometry, EmulatedConfig, EmulatedDevice, NodeTransport};
pub use command_queue::CommandQueue;
pub use config::{
    DispatcherConfig, GrowthPolicy, MemoryConfig, SessionConfig, WorkerPoolConfig,
};
pub use discovery::{DeviceInfo, DeviceManager};
pub use dispatcher::{Command, DeviceEvent, Dispatcher, Response, ResponseError, ResponseFuture};
pub use error::{EtError, MemoryError, Result};
pub use memory::{BufferKind, DeviceBuffer, MemRegion, MemoryManager};
pub use session::{DeviceSession, ServiceResponse, Transfer};
pub use transport::{
    CommandSink, DeviceQuery, DeviceTransport, ResponseSource, TransportType, VirtualQueue,
};
pub use version::{DeviceApiChecker, GitVersionChecker, NegotiatedVersion};
pub use worker_pool::WorkerPool;

/// Wire model, re-exported for callers building raw commands.
pub use etsoc_api as api;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        BufferKind, Command, DeviceBuffer, DeviceManager, DeviceSession, EmulatedDevice, EtError,
        MemoryManager, Response, ResponseError, Result, SessionConfig, WorkerPool,
        WorkerPoolConfig,
    };
}
