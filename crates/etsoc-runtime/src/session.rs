// SPDX-License-Identifier: AGPL-3.0-only

//! Per-device session
//!
//! A [`DeviceSession`] owns everything the host keeps for one card:
//!
//! ```text
//!   DeviceSession
//!     ├─ ops Dispatcher ──────── VirtualQueue::Ops(n)
//!     ├─ mgmt Dispatcher ─────── VirtualQueue::Management
//!     ├─ MemoryManager (code / data / host staging regions)
//!     ├─ DeviceApiChecker (gates protocol traffic)
//!     └─ GitVersionChecker (diagnostics)
//! ```
//!
//! Protocol traffic is refused until [`DeviceSession::negotiate`] has
//! succeeded. Memory management and firmware hash queries work at any time.
//!
//! DMA addresses the host staging window directly, so it is only offered on
//! transports whose staging window the device can reach (the emulated one).
//! Kernel nodes would need driver-pinned host buffers.

use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Receiver;
use etsoc_api::mgmt::DmCmd;
use etsoc_api::ops::{
    AbortCmd, CmResetCmd, DmaReadListCmd, DmaReadNode, DmaWriteListCmd, DmaWriteNode, EchoCmd,
    EchoRsp, FwVersionRsp, KernelAbortCmd, KernelLaunchCmd, OpsCommand,
};
use tracing::{debug, info};

use crate::config::{MemoryConfig, SessionConfig};
use crate::dispatcher::{Command, DeviceEvent, Dispatcher, Response, ResponseFuture};
use crate::error::{EtError, MemoryError, Result};
use crate::memory::{BufferKind, DeviceBuffer, MemoryManager};
use crate::transport::{DeviceTransport, TransportType, VirtualQueue};
use crate::version::{DeviceApiChecker, GitVersionChecker, NegotiatedVersion};

/// Command in flight that keeps its buffers alive until it resolves
#[derive(Debug)]
pub struct Transfer {
    future: ResponseFuture,
    buffers: Vec<DeviceBuffer>,
}

impl Transfer {
    /// Tag assigned to the command
    pub const fn tag_id(&self) -> u16 {
        self.future.tag_id()
    }

    /// Block until the device answers, then release the buffers.
    pub fn wait(self) -> Response {
        let rsp = self.future.wait();
        drop(self.buffers);
        rsp
    }

    /// Buffers held by this transfer
    pub fn buffers(&self) -> &[DeviceBuffer] {
        &self.buffers
    }
}

/// Management command answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    /// Payload after the management header
    pub payload: Bytes,
    /// Time the device spent on the request
    pub device_latency_usec: u64,
}

/// Host-side state for one device
pub struct DeviceSession {
    config: SessionConfig,
    transport_type: TransportType,
    ops: Dispatcher,
    mgmt: Dispatcher,
    memory: MemoryManager,
    api: DeviceApiChecker,
    firmware: GitVersionChecker,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device", &self.config.device)
            .field("ops", &self.ops)
            .field("negotiated", &self.api.negotiated())
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Start dispatchers and carve device memory.
    ///
    /// Does not talk to the device; call [`Self::negotiate`] next.
    ///
    /// # Errors
    ///
    /// Returns error if the device or queue index is invalid or the memory
    /// layout does not fit.
    pub fn open<T: DeviceTransport + 'static>(
        transport: Arc<T>,
        config: SessionConfig,
    ) -> Result<Self> {
        let memory_config = config
            .memory
            .clone()
            .unwrap_or_else(|| MemoryConfig::from_transport(transport.as_ref()));
        let memory = MemoryManager::new(config.device, &memory_config)?;
        let transport_type = transport.transport_type();

        let transport: Arc<dyn DeviceTransport> = transport;
        let ops = Dispatcher::start(
            Arc::clone(&transport),
            config.device,
            VirtualQueue::Ops(config.ops_queue),
            config.dispatcher.clone(),
        )?;
        let mgmt = Dispatcher::start(
            transport,
            config.device,
            VirtualQueue::Management,
            config.dispatcher.clone(),
        )?;

        info!(
            "Opened session on device {} (ops queue {}, {:?} transport)",
            config.device, config.ops_queue, transport_type
        );

        Ok(Self {
            api: DeviceApiChecker::new(config.host_api),
            firmware: GitVersionChecker::default(),
            config,
            transport_type,
            ops,
            mgmt,
            memory,
        })
    }

    /// Run the compatibility handshake (once) and require a pass.
    ///
    /// # Errors
    ///
    /// Returns [`EtError::IncompatibleDevice`] if the device refused the
    /// host version or fails the compatibility policy, or the query error.
    pub fn negotiate(&self) -> Result<NegotiatedVersion> {
        let negotiated = self
            .api
            .get_device_api_version(&self.ops, self.config.request_timeout)?;
        if !self.api.is_device_supported() {
            return Err(EtError::IncompatibleDevice {
                device: negotiated.device,
                host: self.api.host(),
            });
        }
        Ok(negotiated)
    }

    /// True once negotiation passed
    pub fn is_negotiated(&self) -> bool {
        self.api.is_device_supported()
    }

    fn ensure_negotiated(&self) -> Result<()> {
        match self.api.negotiated() {
            None => Err(EtError::invalid_state("API version not negotiated")),
            Some(n) if !self.api.is_device_supported() => Err(EtError::IncompatibleDevice {
                device: n.device,
                host: self.api.host(),
            }),
            Some(_) => Ok(()),
        }
    }

    // ── Device ops ───────────────────────────────────────────────────────────

    /// Submit a raw command on the ops queue.
    ///
    /// # Errors
    ///
    /// Returns error if negotiation has not passed or the dispatcher refuses
    /// the command.
    pub fn submit(&self, command: Command) -> Result<ResponseFuture> {
        self.ensure_negotiated()?;
        self.ops.submit(command)
    }

    /// Submit a typed ops command.
    ///
    /// # Errors
    ///
    /// See [`Self::submit`]; also fails if the payload violates a firmware limit.
    pub fn submit_ops<C: OpsCommand>(&self, cmd: &C) -> Result<ResponseFuture> {
        self.submit(Command::ops(cmd)?)
    }

    fn call_ops<C: OpsCommand>(&self, cmd: &C) -> Result<Response> {
        self.ensure_negotiated()?;
        self.ops.call(Command::ops(cmd)?, self.config.request_timeout)
    }

    /// Echo a word through the firmware.
    ///
    /// # Errors
    ///
    /// Returns error if the round trip fails or the word comes back changed.
    pub fn echo(&self, word: u64) -> Result<u64> {
        let rsp: EchoRsp = self.call_ops(&EchoCmd { payload: word })?.decode()?;
        if rsp.payload != word {
            return Err(EtError::transport(format!(
                "Echo mismatch: sent {word:#x}, got {:#x}",
                rsp.payload
            )));
        }
        Ok(rsp.payload)
    }

    /// Copy `size` bytes from a host staging buffer into device memory.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot reach host staging memory,
    /// the buffers have the wrong kind, `size` exceeds either buffer, or
    /// submission fails.
    pub fn dma_write(
        &self,
        src: &DeviceBuffer,
        dst: &DeviceBuffer,
        size: u32,
    ) -> Result<Transfer> {
        self.check_staging_reachable()?;
        check_transfer(src, dst, size)?;
        let cmd = DmaWriteListCmd {
            nodes: vec![DmaWriteNode {
                src_host_virt_addr: src.device_address(),
                src_host_phy_addr: src.device_address(),
                dst_device_phy_addr: dst.device_address(),
                size,
            }],
        };
        debug!("DMA write {size} bytes to {:#x}", dst.device_address());
        Ok(Transfer {
            future: self.submit_ops(&cmd)?,
            buffers: vec![src.clone(), dst.clone()],
        })
    }

    /// Copy `size` bytes from device memory into a host staging buffer.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::dma_write`].
    pub fn dma_read(
        &self,
        src: &DeviceBuffer,
        dst: &DeviceBuffer,
        size: u32,
    ) -> Result<Transfer> {
        self.check_staging_reachable()?;
        check_transfer(dst, src, size)?;
        let cmd = DmaReadListCmd {
            nodes: vec![DmaReadNode {
                dst_host_virt_addr: dst.device_address(),
                dst_host_phy_addr: dst.device_address(),
                src_device_phy_addr: src.device_address(),
                size,
            }],
        };
        debug!("DMA read {size} bytes from {:#x}", src.device_address());
        Ok(Transfer {
            future: self.submit_ops(&cmd)?,
            buffers: vec![src.clone(), dst.clone()],
        })
    }

    /// Launch the kernel at `code` with its argument block at `args`.
    ///
    /// # Errors
    ///
    /// Returns error if `code` is not a code buffer or submission fails.
    pub fn launch_kernel(
        &self,
        code: &DeviceBuffer,
        args: &DeviceBuffer,
        shire_mask: u64,
    ) -> Result<Transfer> {
        if code.kind() != BufferKind::Code {
            return Err(EtError::invalid_state(format!(
                "kernel entry must be a code buffer, got {:?}",
                code.kind()
            )));
        }
        let cmd = KernelLaunchCmd {
            code_start_address: code.device_address(),
            pointer_to_args: args.device_address(),
            exception_buffer: 0,
            shire_mask,
            argument_payload: Vec::new(),
        };
        Ok(Transfer {
            future: self.submit_ops(&cmd)?,
            buffers: vec![code.clone(), args.clone()],
        })
    }

    /// Ask firmware to abort the command with `tag_id`.
    ///
    /// The aborted command still resolves through its own response.
    ///
    /// # Errors
    ///
    /// Returns error if the abort request itself fails.
    pub fn abort(&self, tag_id: u16) -> Result<()> {
        info!("Aborting tag {tag_id} on device {}", self.config.device);
        self.call_ops(&AbortCmd { tag_id }).map(drop)
    }

    /// Abort a running kernel by its launch tag.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails.
    pub fn kernel_abort(&self, kernel_launch_tag_id: u16) -> Result<()> {
        self.call_ops(&KernelAbortCmd {
            kernel_launch_tag_id,
        })
        .map(drop)
    }

    /// Reset the compute minions in `cm_shire_mask`.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails.
    pub fn cm_reset(&self, cm_shire_mask: u64) -> Result<()> {
        self.call_ops(&CmResetCmd { cm_shire_mask }).map(drop)
    }

    /// Firmware commit hash, queried once per session.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn fw_hash(&self) -> Result<u64> {
        self.firmware
            .device_fw_hash(&self.ops, self.config.request_timeout)
    }

    /// Firmware version, queried once per session.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn firmware_version(&self) -> Result<FwVersionRsp> {
        self.firmware
            .firmware_version(&self.ops, self.config.request_timeout)
    }

    // ── Management ───────────────────────────────────────────────────────────

    /// Send a management command and wait for its answer.
    ///
    /// # Errors
    ///
    /// Returns error if negotiation has not passed, `cmd` is outside the
    /// management range, or the device reports failure.
    pub fn service_request(&self, cmd: DmCmd, payload: &[u8]) -> Result<ServiceResponse> {
        self.ensure_negotiated()?;
        if !cmd.is_valid() {
            return Err(EtError::invalid_state(format!(
                "management command {} out of range",
                cmd.as_u16()
            )));
        }
        let rsp = self.mgmt.call(
            Command::new(cmd.as_u16(), Bytes::copy_from_slice(payload)),
            self.config.request_timeout,
        )?;
        Ok(ServiceResponse {
            device_latency_usec: rsp.device_latency_usec.unwrap_or(0),
            payload: rsp.payload,
        })
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    /// Buffer allocator for this device
    pub const fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Unsolicited firmware events from now on
    pub fn events(&self) -> Receiver<DeviceEvent> {
        self.ops.subscribe_events()
    }

    /// Ops dispatcher
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.ops
    }

    /// Device index
    pub const fn device(&self) -> usize {
        self.config.device
    }

    /// Transport this session runs on
    pub const fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    fn check_staging_reachable(&self) -> Result<()> {
        match self.transport_type {
            TransportType::Emulated => Ok(()),
            TransportType::Node => Err(EtError::invalid_state(
                "DMA on kernel nodes needs driver-pinned host buffers",
            )),
        }
    }

    /// Stop both dispatchers; outstanding commands resolve as shut down.
    pub fn shutdown(&self) {
        self.ops.shutdown();
        self.mgmt.shutdown();
        info!("Closed session on device {}", self.config.device);
    }
}

fn check_transfer(host: &DeviceBuffer, device: &DeviceBuffer, size: u32) -> Result<()> {
    if host.kind() != BufferKind::HostStaging {
        return Err(EtError::invalid_state(format!(
            "DMA host side must be a staging buffer, got {:?}",
            host.kind()
        )));
    }
    if device.kind() == BufferKind::HostStaging {
        return Err(EtError::invalid_state("DMA device side is a staging buffer"));
    }
    let end = u64::from(size);
    for buf in [host, device] {
        if end > buf.size() {
            return Err(MemoryError::OutOfBounds {
                offset: end,
                size: buf.size(),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use etsoc_api::mgmt::{DmCmd, ModuleUptime};
    use etsoc_api::ops::{DmaListRsp, DmaStatus, KernelLaunchRsp, KernelLaunchStatus, MsgId};
    use etsoc_api::ApiVersion;

    use super::*;
    use crate::backends::emulated::{EmulatedConfig, EmulatedDevice};
    use crate::transport::{CommandSink, DeviceQuery, ResponseSource};

    fn session(config: EmulatedConfig) -> (Arc<EmulatedDevice>, DeviceSession) {
        let device = Arc::new(EmulatedDevice::with_config(config));
        let session = DeviceSession::open(
            Arc::clone(&device),
            SessionConfig::default().with_request_timeout(Duration::from_secs(5)),
        )
        .unwrap();
        (device, session)
    }

    #[test]
    fn traffic_refused_before_negotiation() {
        let (dev, s) = session(EmulatedConfig::default());
        assert!(matches!(s.echo(1), Err(EtError::InvalidState { .. })));
        assert!(s.service_request(DmCmd::GET_MODULE_UPTIME, &[]).is_err());
        assert_eq!(dev.commands_received(MsgId::EchoCmd.as_u16()), 0);

        s.negotiate().unwrap();
        assert!(s.is_negotiated());
        assert_eq!(s.echo(0xDEAD_BEEF).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn incompatible_device_fails_closed() {
        let config = EmulatedConfig::default().with_api_version(ApiVersion::new(9, 0, 0));
        let (dev, s) = session(config);
        assert!(matches!(s.negotiate(), Err(EtError::IncompatibleDevice { .. })));
        assert!(matches!(s.echo(1), Err(EtError::IncompatibleDevice { .. })));
        assert!(matches!(s.negotiate(), Err(EtError::IncompatibleDevice { .. })));
        assert_eq!(dev.commands_received(MsgId::CheckApiCompatibilityCmd.as_u16()), 1);
        assert_eq!(dev.commands_received(MsgId::EchoCmd.as_u16()), 0);
    }

    #[test]
    fn explicit_layout_and_newer_host() {
        let device = Arc::new(EmulatedDevice::new());
        let config = SessionConfig::for_device(0)
            .with_memory(MemoryConfig::minimal())
            .with_host_api(ApiVersion::new(1, 9, 0))
            .with_dispatcher(
                crate::config::DispatcherConfig::default()
                    .with_response_timeout(Duration::from_secs(5)),
            );
        let s = DeviceSession::open(device, config).unwrap();

        assert_eq!(s.memory().device_code().size(), MemoryConfig::minimal().code_region_size);
        assert!(s.negotiate().is_ok());
    }

    #[test]
    fn fw_hash_needs_no_negotiation() {
        let (_dev, s) = session(EmulatedConfig::default().with_fw_git_hash(0xfeed));
        assert_eq!(s.fw_hash().unwrap(), 0xfeed);
    }

    #[test]
    fn dma_write_holds_buffers_until_resolved() {
        let (_dev, s) = session(EmulatedConfig::default());
        s.negotiate().unwrap();

        let host = s.memory().malloc_host(4096).unwrap();
        let dev_buf = s.memory().malloc_placeholder(4096).unwrap();
        let transfer = s.dma_write(&host, &dev_buf, 4096).unwrap();
        assert_eq!(dev_buf.ref_count(), 2);

        let rsp = transfer.wait();
        assert!(rsp.is_ok());
        assert_eq!(rsp.decode::<DmaListRsp>().unwrap().dma_status(), DmaStatus::Complete);
        assert_eq!(dev_buf.ref_count(), 1);
    }

    #[test]
    fn dma_read_round_trip() {
        let (_dev, s) = session(EmulatedConfig::default());
        s.negotiate().unwrap();
        let host = s.memory().malloc_host(256).unwrap();
        let dev_buf = s.memory().malloc_constant(256).unwrap();
        assert!(s.dma_read(&dev_buf, &host, 256).unwrap().wait().is_ok());
    }

    #[test]
    fn dma_rejects_oversized_and_misplaced_buffers() {
        let (_dev, s) = session(EmulatedConfig::default());
        s.negotiate().unwrap();
        let host = s.memory().malloc_host(64).unwrap();
        let dev_buf = s.memory().malloc_placeholder(64).unwrap();

        assert!(matches!(
            s.dma_write(&host, &dev_buf, 128),
            Err(EtError::Memory {
                source: MemoryError::OutOfBounds {
                    offset: 128,
                    size: 64
                }
            })
        ));
        let tail = dev_buf.offset_by(48).unwrap();
        assert!(matches!(
            s.dma_read(&tail, &host, 32),
            Err(EtError::Memory {
                source: MemoryError::OutOfBounds {
                    offset: 32,
                    size: 16
                }
            })
        ));
        assert!(s.dma_write(&dev_buf, &host, 64).is_err());
        assert!(s.dma_write(&host, &host, 64).is_err());
    }

    /// Emulated device that reports itself as a kernel node
    #[derive(Debug)]
    struct NodeBacked(EmulatedDevice);

    impl CommandSink for NodeBacked {
        fn send_command(&self, device: usize, queue: VirtualQueue, frame: &[u8]) -> Result<()> {
            self.0.send_command(device, queue, frame)
        }
    }

    impl ResponseSource for NodeBacked {
        fn receive_response(
            &self,
            device: usize,
            queue: VirtualQueue,
            timeout: Duration,
        ) -> Result<Option<Bytes>> {
            self.0.receive_response(device, queue, timeout)
        }
    }

    impl DeviceQuery for NodeBacked {
        fn devices_count(&self) -> usize {
            self.0.devices_count()
        }

        fn virtual_queues_count(&self, device: usize) -> Result<usize> {
            self.0.virtual_queues_count(device)
        }

        fn dma_alignment(&self) -> usize {
            self.0.dma_alignment()
        }

        fn dram_size(&self) -> u64 {
            self.0.dram_size()
        }

        fn dram_base_address(&self) -> u64 {
            self.0.dram_base_address()
        }

        fn transport_type(&self) -> TransportType {
            TransportType::Node
        }
    }

    #[test]
    fn dma_refused_without_pinned_staging() {
        let device = Arc::new(NodeBacked(EmulatedDevice::new()));
        let s = DeviceSession::open(Arc::clone(&device), SessionConfig::default()).unwrap();
        s.negotiate().unwrap();
        assert_eq!(s.transport_type(), TransportType::Node);

        let host = s.memory().malloc_host(4096).unwrap();
        let dev_buf = s.memory().malloc_placeholder(4096).unwrap();
        assert!(matches!(
            s.dma_write(&host, &dev_buf, 4096),
            Err(EtError::InvalidState { .. })
        ));
        assert!(matches!(
            s.dma_read(&dev_buf, &host, 4096),
            Err(EtError::InvalidState { .. })
        ));
        assert_eq!(device.0.commands_received(MsgId::DmaWriteListCmd.as_u16()), 0);
        assert_eq!(device.0.commands_received(MsgId::DmaReadListCmd.as_u16()), 0);
        assert_eq!(dev_buf.ref_count(), 1);

        // Non-DMA traffic still flows.
        assert_eq!(s.echo(9).unwrap(), 9);
    }

    #[test]
    fn kernel_launch() {
        let (_dev, s) = session(EmulatedConfig::default());
        s.negotiate().unwrap();
        let code = s.memory().malloc_code(4096).unwrap();
        let args = s.memory().malloc_constant(64).unwrap();

        let rsp = s.launch_kernel(&code, &args, 0xffff).unwrap().wait();
        assert!(rsp.is_ok());
        assert_eq!(
            rsp.decode::<KernelLaunchRsp>().unwrap().launch_status(),
            KernelLaunchStatus::Completed
        );
        assert!(s.launch_kernel(&args, &args, 1).is_err());
    }

    #[test]
    fn abort_and_reset_pass_through() {
        let (dev, s) = session(EmulatedConfig::default());
        s.negotiate().unwrap();
        s.abort(42).unwrap();
        s.kernel_abort(43).unwrap();
        s.cm_reset(0b1010).unwrap();
        assert_eq!(dev.commands_received(MsgId::AbortCmd.as_u16()), 1);
        assert_eq!(dev.commands_received(MsgId::KernelAbortCmd.as_u16()), 1);
        assert_eq!(dev.commands_received(MsgId::CmResetCmd.as_u16()), 1);
    }

    #[test]
    fn management_request_reports_latency() {
        let (_dev, s) = session(EmulatedConfig::default());
        s.negotiate().unwrap();
        let rsp = s.service_request(DmCmd::GET_MODULE_UPTIME, &[]).unwrap();
        assert_eq!(rsp.device_latency_usec, 150);
        assert!(ModuleUptime::decode(&rsp.payload).is_ok());
    }

    #[test]
    fn management_failure_status() {
        let (_dev, s) = session(EmulatedConfig::default().with_mgmt_status(-5));
        s.negotiate().unwrap();
        assert!(matches!(
            s.service_request(DmCmd::GET_MODULE_POWER, &[]),
            Err(EtError::DeviceStatus { status: -5, .. })
        ));
    }

    #[test]
    fn shutdown_resolves_outstanding() {
        let (dev, s) = session(EmulatedConfig::default());
        s.negotiate().unwrap();
        dev.set_silent(true);
        let pending = s.submit_ops(&EchoCmd { payload: 7 }).unwrap();
        s.shutdown();
        assert!(!pending.wait().is_ok());
    }
}
