// SPDX-License-Identifier: AGPL-3.0-only

//! Runtime configuration
//!
//! Every config has a `Default` suitable for a single-card host and, where
//! device geometry matters, a constructor that derives values from what the
//! transport reports at run time.

use std::time::Duration;

use etsoc_api::version::HOST_API_VERSION;
use etsoc_api::ApiVersion;
use tracing::debug;

use crate::transport::DeviceQuery;

/// Allocation granule of every memory region.
pub const REGION_ALIGNMENT: u64 = 1 << 20;

/// Synthetic base of the host-pinned staging window.
pub const HOST_STAGING_BASE: u64 = 0x0000_7e00_0000_0000;

// ── Worker pool ──────────────────────────────────────────────────────────────

/// How a [`crate::WorkerPool`] grows when every worker is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// Never spawn beyond the initial workers
    Fixed,
    /// Spawn one worker per submission that finds no idle worker, up to a cap
    Bounded {
        /// Hard ceiling on live workers
        max_workers: usize,
    },
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Workers spawned at construction
    pub initial_workers: usize,

    /// Growth under contention
    pub growth: GrowthPolicy,

    /// On drop: run everything queued (`true`) or discard unstarted tasks
    pub drain_on_shutdown: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        Self {
            initial_workers: cores,
            growth: GrowthPolicy::Fixed,
            drain_on_shutdown: true,
        }
    }
}

impl WorkerPoolConfig {
    /// Fixed-size pool
    pub const fn fixed(workers: usize) -> Self {
        Self {
            initial_workers: workers,
            growth: GrowthPolicy::Fixed,
            drain_on_shutdown: true,
        }
    }

    /// Allow growth up to `max_workers`
    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.growth = GrowthPolicy::Bounded { max_workers };
        self
    }

    /// Choose drain or discard on drop
    #[must_use]
    pub const fn with_drain_on_shutdown(mut self, drain: bool) -> Self {
        self.drain_on_shutdown = drain;
        self
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Upper bound on one `receive_response` wait
    pub poll_interval: Duration,

    /// Retire pending commands older than this with a timeout response.
    /// `None` keeps abandoned commands pending until the device replies.
    pub response_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            response_timeout: None,
        }
    }
}

impl DispatcherConfig {
    /// Set the device-level response timeout
    #[must_use]
    pub const fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Set the receive poll interval
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

// ── Memory ───────────────────────────────────────────────────────────────────

/// Region layout for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Allocation granule for every region
    pub region_alignment: u64,

    /// Start of the device DRAM window
    pub dram_base: u64,

    /// Size of the device DRAM window
    pub dram_size: u64,

    /// Bytes at the start of DRAM reserved for kernel code
    pub code_region_size: u64,

    /// Start of the host-pinned staging window
    pub host_staging_base: u64,

    /// Size of the host-pinned staging window
    pub host_staging_size: u64,

    /// Abort the process on the first failed release instead of recording it
    pub fail_fast_on_corruption: bool,
}

impl MemoryConfig {
    /// Derive the layout from what the transport reports.
    ///
    /// One eighth of DRAM (at least one granule) goes to code; staging
    /// mirrors the code window size.
    pub fn from_transport(query: &dyn DeviceQuery) -> Self {
        let alignment = REGION_ALIGNMENT.max(query.dma_alignment() as u64);
        let dram_size = query.dram_size() / alignment * alignment;
        let code_region_size = (dram_size / 8 / alignment * alignment).max(alignment);

        debug!(
            "Memory layout: DRAM {:#x}+{:#x}, code {:#x}, alignment {:#x}",
            query.dram_base_address(),
            dram_size,
            code_region_size,
            alignment
        );

        Self {
            region_alignment: alignment,
            dram_base: query.dram_base_address(),
            dram_size,
            code_region_size,
            host_staging_base: HOST_STAGING_BASE,
            host_staging_size: code_region_size,
            fail_fast_on_corruption: false,
        }
    }

    /// Small layout for unit tests: 4 MiB code, 12 MiB data, 4 MiB staging
    #[cfg(test)]
    pub const fn minimal() -> Self {
        Self {
            region_alignment: REGION_ALIGNMENT,
            dram_base: 0x8000_0000,
            dram_size: 16 * REGION_ALIGNMENT,
            code_region_size: 4 * REGION_ALIGNMENT,
            host_staging_base: HOST_STAGING_BASE,
            host_staging_size: 4 * REGION_ALIGNMENT,
            fail_fast_on_corruption: false,
        }
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// Everything a [`crate::DeviceSession`] needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Device index on the transport
    pub device: usize,

    /// Ops queue used for commands
    pub ops_queue: usize,

    /// API this host speaks
    pub host_api: ApiVersion,

    /// How long negotiation and helper calls wait for a response
    pub request_timeout: Duration,

    /// Dispatcher tuning (applies to ops and management queues)
    pub dispatcher: DispatcherConfig,

    /// Region layout; `None` derives it from the transport
    pub memory: Option<MemoryConfig>,
}

impl SessionConfig {
    /// Defaults for `device`
    pub fn for_device(device: usize) -> Self {
        Self {
            device,
            ..Self::default()
        }
    }

    /// Override the host API version
    #[must_use]
    pub const fn with_host_api(mut self, host_api: ApiVersion) -> Self {
        self.host_api = host_api;
        self
    }

    /// Override the request timeout
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Use a fixed region layout instead of deriving one
    #[must_use]
    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Override dispatcher tuning
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: 0,
            ops_queue: 0,
            host_api: HOST_API_VERSION,
            request_timeout: Duration::from_secs(5),
            dispatcher: DispatcherConfig::default(),
            memory: None,
        }
    }
}
