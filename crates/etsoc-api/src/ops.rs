// SPDX-License-Identifier: AGPL-3.0-only

//! Device-ops API: the master minion command/response protocol.
//!
//! Message ids occupy `512..=1023`. Every command id is immediately followed
//! by its response id; events (unsolicited device-to-host frames) carry no
//! meaningful `tag_id` and are never correlated with a command.
//!
//! | Command | Response payload |
//! |---------|------------------|
//! | `CheckApiCompatibilityCmd` | status, device API triple, schema hash |
//! | `FwVersionCmd` | status, firmware triple, type, commit hash |
//! | `EchoCmd` | echoed word, dispatch timestamp, status |
//! | `AbortCmd` / `KernelAbortCmd` | status |
//! | `KernelLaunchCmd` / `DmaReadListCmd` / `DmaWriteListCmd` | timing, status |
//! | `CmResetCmd` | status |

use crate::codec::{Reader, Writer};
use crate::error::WireError;
use crate::version::ApiVersion;

/// First id of the device-ops range (`DEV_OPS_API_MID_NONE`).
pub const MSG_ID_NONE: u16 = 512;

/// Last id of the device-ops range (`DEV_OPS_API_MID_LAST`).
pub const MSG_ID_LAST: u16 = 1023;

/// Maximum argument payload embedded in a kernel launch command.
pub const KERNEL_LAUNCH_ARGS_PAYLOAD_MAX: usize = 128;

/// Maximum nodes in a single DMA read/write list command.
pub const DMA_LIST_NODES_MAX: usize = 4;

/// Generic success status shared by every ops response.
pub const STATUS_SUCCESS: u32 = 0;

// ── Message ids ──────────────────────────────────────────────────────────────

/// `device_ops_api_msg_e`
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum MsgId {
    CheckApiCompatibilityCmd = 513,
    ApiCompatibilityRsp = 514,
    FwVersionCmd = 515,
    FwVersionRsp = 516,
    EchoCmd = 517,
    EchoRsp = 518,
    AbortCmd = 519,
    AbortRsp = 520,
    KernelLaunchCmd = 521,
    KernelLaunchRsp = 522,
    KernelAbortCmd = 523,
    KernelAbortRsp = 524,
    DmaReadListCmd = 525,
    DmaReadListRsp = 526,
    DmaWriteListCmd = 527,
    DmaWriteListRsp = 528,
    TraceRtConfigCmd = 529,
    TraceRtConfigRsp = 530,
    TraceRtControlCmd = 531,
    TraceRtControlRsp = 532,
    CmResetCmd = 533,
    CmResetRsp = 534,
    DeviceFwError = 535,
    TraceBufferFullEvent = 536,
    P2pDmaReadListCmd = 537,
    P2pDmaReadListRsp = 538,
    P2pDmaWriteListCmd = 539,
    P2pDmaWriteListRsp = 540,
}

impl MsgId {
    const ALL: [Self; 28] = [
        Self::CheckApiCompatibilityCmd,
        Self::ApiCompatibilityRsp,
        Self::FwVersionCmd,
        Self::FwVersionRsp,
        Self::EchoCmd,
        Self::EchoRsp,
        Self::AbortCmd,
        Self::AbortRsp,
        Self::KernelLaunchCmd,
        Self::KernelLaunchRsp,
        Self::KernelAbortCmd,
        Self::KernelAbortRsp,
        Self::DmaReadListCmd,
        Self::DmaReadListRsp,
        Self::DmaWriteListCmd,
        Self::DmaWriteListRsp,
        Self::TraceRtConfigCmd,
        Self::TraceRtConfigRsp,
        Self::TraceRtControlCmd,
        Self::TraceRtControlRsp,
        Self::CmResetCmd,
        Self::CmResetRsp,
        Self::DeviceFwError,
        Self::TraceBufferFullEvent,
        Self::P2pDmaReadListCmd,
        Self::P2pDmaReadListRsp,
        Self::P2pDmaWriteListCmd,
        Self::P2pDmaWriteListRsp,
    ];

    /// Raw wire value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Look up a wire value.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownMessage`] for ids outside the catalog.
    pub fn from_u16(raw: u16) -> Result<Self, WireError> {
        Self::ALL
            .iter()
            .copied()
            .find(|id| id.as_u16() == raw)
            .ok_or(WireError::UnknownMessage { msg_id: raw })
    }

    /// True for unsolicited device events.
    #[must_use]
    pub const fn is_event(self) -> bool {
        matches!(self, Self::DeviceFwError | Self::TraceBufferFullEvent)
    }

    /// True for host-to-device commands.
    #[must_use]
    pub const fn is_command(self) -> bool {
        !self.is_event() && (self as u16 - MSG_ID_NONE) % 2 == 1 && (self as u16) < 535
            || matches!(self, Self::P2pDmaReadListCmd | Self::P2pDmaWriteListCmd)
    }

    /// Response id paired with a command id.
    #[must_use]
    pub fn response_id(self) -> Option<Self> {
        if self.is_command() {
            Self::from_u16(self.as_u16() + 1).ok()
        } else {
            None
        }
    }
}

/// True if `raw` lies in the device-ops id range.
#[must_use]
pub const fn is_ops_msg_id(raw: u16) -> bool {
    raw > MSG_ID_NONE && raw < MSG_ID_LAST
}

// ── Payload traits ───────────────────────────────────────────────────────────

/// A command payload that follows `cmd_header_t`.
pub trait OpsCommand {
    /// Message id written into the header.
    const MSG_ID: MsgId;

    /// Encode the payload (without header).
    ///
    /// # Errors
    ///
    /// Returns an error if the payload violates a firmware limit.
    fn encode_payload(&self) -> Result<Vec<u8>, WireError>;
}

/// A response payload that follows `rsp_header_t`.
pub trait OpsResponse: Sized {
    /// Response ids this layout decodes.
    const MSG_IDS: &'static [MsgId];

    /// Decode the payload (without header).
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] for short payloads.
    fn decode_payload(payload: &[u8]) -> Result<Self, WireError>;

    /// Device-reported status field.
    fn status(&self) -> u32;
}

/// Extract the status word from any known ops response payload.
///
/// Returns `Ok(None)` for events and for ids without a status field.
///
/// # Errors
///
/// Returns [`WireError::Truncated`] when the id carries a status but the
/// payload is too short to hold it.
pub fn response_status(msg_id: MsgId, payload: &[u8]) -> Result<Option<u32>, WireError> {
    let status = match msg_id {
        MsgId::ApiCompatibilityRsp => ApiCompatibilityRsp::decode_payload(payload)?.status,
        MsgId::FwVersionRsp => FwVersionRsp::decode_payload(payload)?.status,
        MsgId::EchoRsp => EchoRsp::decode_payload(payload)?.status,
        MsgId::KernelLaunchRsp => KernelLaunchRsp::decode_payload(payload)?.status,
        MsgId::DmaReadListRsp | MsgId::DmaWriteListRsp => DmaListRsp::decode_payload(payload)?.status,
        MsgId::AbortRsp
        | MsgId::KernelAbortRsp
        | MsgId::CmResetRsp
        | MsgId::TraceRtConfigRsp
        | MsgId::TraceRtControlRsp
        | MsgId::P2pDmaReadListRsp
        | MsgId::P2pDmaWriteListRsp => StatusRsp::decode_payload(payload)?.status,
        _ => return Ok(None),
    };
    Ok(Some(status))
}

// ── Compatibility ────────────────────────────────────────────────────────────

/// `DEV_OPS_API_COMPATIBILITY_RESPONSE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibilityStatus {
    /// Device accepts the host's API.
    Success,
    /// Device failed to evaluate the request.
    UnexpectedError,
    /// Request aborted by the host.
    HostAborted,
    /// Value not in the catalog.
    Other(u32),
}

impl From<u32> for CompatibilityStatus {
    fn from(raw: u32) -> Self {
        match raw {
            0 => Self::Success,
            1 => Self::UnexpectedError,
            2 => Self::HostAborted,
            other => Self::Other(other),
        }
    }
}

/// Ask firmware which API version it implements, advertising ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiCompatibilityCmd {
    /// Version the host speaks.
    pub host: ApiVersion,
}

impl OpsCommand for ApiCompatibilityCmd {
    const MSG_ID: MsgId = MsgId::CheckApiCompatibilityCmd;

    fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        let mut w = Writer::with_capacity(8);
        w.put_u16(self.host.major)
            .put_u16(self.host.minor)
            .put_u16(self.host.patch)
            .pad(2);
        Ok(w.into_inner())
    }
}

impl ApiCompatibilityCmd {
    /// Decode (device side).
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] for short payloads.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            host: ApiVersion::new(r.get_u16()?, r.get_u16()?, r.get_u16()?),
        })
    }
}

/// Firmware's answer to [`ApiCompatibilityCmd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiCompatibilityRsp {
    /// Raw `dev_ops_api_compatibility_response_e`.
    pub status: u32,
    /// API version implemented by firmware.
    pub device: ApiVersion,
}

impl ApiCompatibilityRsp {
    /// Encode (device side).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(24);
        w.put_u32(self.status)
            .put_u16(self.device.major)
            .put_u16(self.device.minor)
            .put_u16(self.device.patch)
            .pad(6)
            .put_u64(self.device.schema_hash);
        w.into_inner()
    }

    /// Typed status.
    #[must_use]
    pub fn compatibility(&self) -> CompatibilityStatus {
        self.status.into()
    }
}

impl OpsResponse for ApiCompatibilityRsp {
    const MSG_IDS: &'static [MsgId] = &[MsgId::ApiCompatibilityRsp];

    fn decode_payload(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let status = r.get_u32()?;
        let major = r.get_u16()?;
        let minor = r.get_u16()?;
        let patch = r.get_u16()?;
        r.skip(6)?;
        let schema_hash = r.get_u64()?;
        Ok(Self {
            status,
            device: ApiVersion {
                major,
                minor,
                patch,
                schema_hash,
            },
        })
    }

    fn status(&self) -> u32 {
        self.status
    }
}

// ── Firmware version ─────────────────────────────────────────────────────────

/// `DEV_OPS_FW_TYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FwType {
    /// Master minion runtime.
    MasterMinion = 0,
    /// Machine minion runtime.
    MachineMinion = 1,
    /// Worker minion runtime.
    WorkerMinion = 2,
}

impl TryFrom<u8> for FwType {
    type Error = WireError;

    fn try_from(raw: u8) -> Result<Self, WireError> {
        match raw {
            0 => Ok(Self::MasterMinion),
            1 => Ok(Self::MachineMinion),
            2 => Ok(Self::WorkerMinion),
            _ => Err(WireError::UnknownMessage {
                msg_id: u16::from(raw),
            }),
        }
    }
}

/// Request the version and commit of one firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwVersionCmd {
    /// Image to describe.
    pub fw_type: FwType,
}

impl OpsCommand for FwVersionCmd {
    const MSG_ID: MsgId = MsgId::FwVersionCmd;

    fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        let mut w = Writer::with_capacity(8);
        w.put_u8(self.fw_type as u8).pad(7);
        Ok(w.into_inner())
    }
}

impl FwVersionCmd {
    /// Decode (device side).
    ///
    /// # Errors
    ///
    /// Returns an error for short payloads or an unknown firmware type.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            fw_type: FwType::try_from(r.get_u8()?)?,
        })
    }
}

/// Firmware's answer to [`FwVersionCmd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwVersionRsp {
    /// Raw `dev_ops_api_fw_version_response_e`.
    pub status: u32,
    /// Firmware version triple.
    pub major: u16,
    /// Firmware version triple.
    pub minor: u16,
    /// Firmware version triple.
    pub patch: u16,
    /// Raw firmware type echoed back.
    pub fw_type: u8,
    /// First 8 bytes of the firmware commit hash.
    pub git_hash: u64,
}

impl FwVersionRsp {
    /// Encode (device side).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(24);
        w.put_u32(self.status)
            .put_u16(self.major)
            .put_u16(self.minor)
            .put_u16(self.patch)
            .put_u8(self.fw_type)
            .pad(5)
            .put_u64(self.git_hash);
        w.into_inner()
    }
}

impl OpsResponse for FwVersionRsp {
    const MSG_IDS: &'static [MsgId] = &[MsgId::FwVersionRsp];

    fn decode_payload(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let status = r.get_u32()?;
        let major = r.get_u16()?;
        let minor = r.get_u16()?;
        let patch = r.get_u16()?;
        let fw_type = r.get_u8()?;
        r.skip(5)?;
        Ok(Self {
            status,
            major,
            minor,
            patch,
            fw_type,
            git_hash: r.get_u64()?,
        })
    }

    fn status(&self) -> u32 {
        self.status
    }
}

// ── Echo ─────────────────────────────────────────────────────────────────────

/// Liveness check; firmware returns the word unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoCmd {
    /// Word to echo.
    pub payload: u64,
}

impl OpsCommand for EchoCmd {
    const MSG_ID: MsgId = MsgId::EchoCmd;

    fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        Ok(self.payload.to_le_bytes().to_vec())
    }
}

impl EchoCmd {
    /// Decode (device side).
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] for short payloads.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            payload: Reader::new(payload).get_u64()?,
        })
    }
}

/// Firmware's answer to [`EchoCmd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoRsp {
    /// Word copied from the command.
    pub payload: u64,
    /// Time (µs) the command left the submission queue.
    pub device_cmd_start_ts: u64,
    /// Raw `dev_ops_api_echo_response_e`.
    pub status: u32,
}

impl EchoRsp {
    /// Encode (device side).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(24);
        w.put_u64(self.payload)
            .put_u64(self.device_cmd_start_ts)
            .put_u32(self.status)
            .pad(4);
        w.into_inner()
    }
}

impl OpsResponse for EchoRsp {
    const MSG_IDS: &'static [MsgId] = &[MsgId::EchoRsp];

    fn decode_payload(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            payload: r.get_u64()?,
            device_cmd_start_ts: r.get_u64()?,
            status: r.get_u32()?,
        })
    }

    fn status(&self) -> u32 {
        self.status
    }
}

// ── Abort ────────────────────────────────────────────────────────────────────

/// Abort a command still pipelined in the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortCmd {
    /// Tag of the command to abort.
    pub tag_id: u16,
}

impl OpsCommand for AbortCmd {
    const MSG_ID: MsgId = MsgId::AbortCmd;

    fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        let mut w = Writer::with_capacity(8);
        w.put_u16(self.tag_id).pad(6);
        Ok(w.into_inner())
    }
}

/// Abort a running kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelAbortCmd {
    /// Tag of the kernel launch to abort.
    pub kernel_launch_tag_id: u16,
}

impl OpsCommand for KernelAbortCmd {
    const MSG_ID: MsgId = MsgId::KernelAbortCmd;

    fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        let mut w = Writer::with_capacity(8);
        w.put_u16(self.kernel_launch_tag_id).pad(6);
        Ok(w.into_inner())
    }
}

/// Reset the compute minions of the selected shires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmResetCmd {
    /// Shires to reset.
    pub cm_shire_mask: u64,
}

impl OpsCommand for CmResetCmd {
    const MSG_ID: MsgId = MsgId::CmResetCmd;

    fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        Ok(self.cm_shire_mask.to_le_bytes().to_vec())
    }
}

/// Responses whose only content is a status word plus padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRsp {
    /// Raw response-specific status.
    pub status: u32,
}

impl StatusRsp {
    /// Encode (device side).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(8);
        w.put_u32(self.status).pad(4);
        w.into_inner()
    }
}

impl OpsResponse for StatusRsp {
    const MSG_IDS: &'static [MsgId] = &[
        MsgId::AbortRsp,
        MsgId::KernelAbortRsp,
        MsgId::CmResetRsp,
        MsgId::TraceRtConfigRsp,
        MsgId::TraceRtControlRsp,
        MsgId::P2pDmaReadListRsp,
        MsgId::P2pDmaWriteListRsp,
    ];

    fn decode_payload(payload: &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            status: Reader::new(payload).get_u32()?,
        })
    }

    fn status(&self) -> u32 {
        self.status
    }
}

// ── Kernel launch and DMA ────────────────────────────────────────────────────

/// Device-side timing block shared by kernel launch and DMA responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandTiming {
    /// Cycle count at dispatch.
    pub start_ts: u64,
    /// Dispatch to completion.
    pub execute_dur: u64,
    /// Arrival to dispatch.
    pub wait_dur: u64,
}

impl CommandTiming {
    fn write(&self, w: &mut Writer) {
        w.put_u64(self.start_ts)
            .put_u64(self.execute_dur)
            .put_u64(self.wait_dur);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            start_ts: r.get_u64()?,
            execute_dur: r.get_u64()?,
            wait_dur: r.get_u64()?,
        })
    }
}

/// `DEV_OPS_API_KERNEL_LAUNCH_RESPONSE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelLaunchStatus {
    /// Kernel ran to completion.
    Completed,
    /// Unexpected firmware error.
    UnexpectedError,
    /// Kernel raised an exception.
    Exception,
    /// Requested shires were not ready.
    ShiresNotReady,
    /// Host aborted the kernel.
    HostAborted,
    /// Code or argument address invalid.
    InvalidAddress,
    /// Kernel hung and was timed out.
    TimeoutHang,
    /// Any other firmware code.
    Other(u32),
}

impl From<u32> for KernelLaunchStatus {
    fn from(raw: u32) -> Self {
        match raw {
            0 => Self::Completed,
            1 => Self::UnexpectedError,
            2 => Self::Exception,
            3 => Self::ShiresNotReady,
            4 => Self::HostAborted,
            5 => Self::InvalidAddress,
            6 => Self::TimeoutHang,
            other => Self::Other(other),
        }
    }
}

/// Launch a compute kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLaunchCmd {
    /// Device address of the kernel entry point.
    pub code_start_address: u64,
    /// Device address of the argument block.
    pub pointer_to_args: u64,
    /// Device address of the exception buffer.
    pub exception_buffer: u64,
    /// Compute shires that run the kernel.
    pub shire_mask: u64,
    /// Optional inline arguments (up to 128 bytes).
    pub argument_payload: Vec<u8>,
}

impl OpsCommand for KernelLaunchCmd {
    const MSG_ID: MsgId = MsgId::KernelLaunchCmd;

    fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        if self.argument_payload.len() > KERNEL_LAUNCH_ARGS_PAYLOAD_MAX {
            return Err(WireError::PayloadTooLarge {
                len: self.argument_payload.len(),
            });
        }
        let mut w = Writer::with_capacity(32 + self.argument_payload.len() + 8);
        w.put_u64(self.code_start_address)
            .put_u64(self.pointer_to_args)
            .put_u64(self.exception_buffer)
            .put_u64(self.shire_mask)
            .put_slice(&self.argument_payload)
            .align_to(8);
        Ok(w.into_inner())
    }
}

/// Firmware's answer to [`KernelLaunchCmd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLaunchRsp {
    /// Device-side timing.
    pub timing: CommandTiming,
    /// Raw `dev_ops_api_kernel_launch_response_e`.
    pub status: u32,
}

impl KernelLaunchRsp {
    /// Typed status.
    #[must_use]
    pub fn launch_status(&self) -> KernelLaunchStatus {
        self.status.into()
    }

    /// Encode (device side).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        encode_timed_status(&self.timing, self.status)
    }
}

impl OpsResponse for KernelLaunchRsp {
    const MSG_IDS: &'static [MsgId] = &[MsgId::KernelLaunchRsp];

    fn decode_payload(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            timing: CommandTiming::read(&mut r)?,
            status: r.get_u32()?,
        })
    }

    fn status(&self) -> u32 {
        self.status
    }
}

/// One device-to-host transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaReadNode {
    /// Destination, host virtual address.
    pub dst_host_virt_addr: u64,
    /// Destination, host physical (bus) address.
    pub dst_host_phy_addr: u64,
    /// Source in device DRAM.
    pub src_device_phy_addr: u64,
    /// Transfer length.
    pub size: u32,
}

/// One host-to-device transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaWriteNode {
    /// Source, host virtual address.
    pub src_host_virt_addr: u64,
    /// Source, host physical (bus) address.
    pub src_host_phy_addr: u64,
    /// Destination in device DRAM.
    pub dst_device_phy_addr: u64,
    /// Transfer length.
    pub size: u32,
}

/// Size of one encoded DMA list node.
pub const DMA_NODE_SIZE: usize = 32;

fn check_nodes(count: usize) -> Result<(), WireError> {
    if count == 0 || count > DMA_LIST_NODES_MAX {
        return Err(WireError::TooManyNodes {
            count,
            max: DMA_LIST_NODES_MAX,
        });
    }
    Ok(())
}

/// Read up to [`DMA_LIST_NODES_MAX`] regions out of device memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaReadListCmd {
    /// Transfers, executed in order.
    pub nodes: Vec<DmaReadNode>,
}

impl OpsCommand for DmaReadListCmd {
    const MSG_ID: MsgId = MsgId::DmaReadListCmd;

    fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        check_nodes(self.nodes.len())?;
        let mut w = Writer::with_capacity(self.nodes.len() * DMA_NODE_SIZE);
        for n in &self.nodes {
            w.put_u64(n.dst_host_virt_addr)
                .put_u64(n.dst_host_phy_addr)
                .put_u64(n.src_device_phy_addr)
                .put_u32(n.size)
                .pad(4);
        }
        Ok(w.into_inner())
    }
}

/// Write up to [`DMA_LIST_NODES_MAX`] regions into device memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaWriteListCmd {
    /// Transfers, executed in order.
    pub nodes: Vec<DmaWriteNode>,
}

impl OpsCommand for DmaWriteListCmd {
    const MSG_ID: MsgId = MsgId::DmaWriteListCmd;

    fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        check_nodes(self.nodes.len())?;
        let mut w = Writer::with_capacity(self.nodes.len() * DMA_NODE_SIZE);
        for n in &self.nodes {
            w.put_u64(n.src_host_virt_addr)
                .put_u64(n.src_host_phy_addr)
                .put_u64(n.dst_device_phy_addr)
                .put_u32(n.size)
                .pad(4);
        }
        Ok(w.into_inner())
    }
}

impl DmaWriteListCmd {
    /// Decode (device side).
    ///
    /// # Errors
    ///
    /// Returns an error for payloads that are not whole nodes.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let mut nodes = Vec::with_capacity(payload.len() / DMA_NODE_SIZE);
        while !r.remaining().is_empty() {
            let src_host_virt_addr = r.get_u64()?;
            let src_host_phy_addr = r.get_u64()?;
            let dst_device_phy_addr = r.get_u64()?;
            let size = r.get_u32()?;
            r.skip(4)?;
            nodes.push(DmaWriteNode {
                src_host_virt_addr,
                src_host_phy_addr,
                dst_device_phy_addr,
                size,
            });
        }
        check_nodes(nodes.len())?;
        Ok(Self { nodes })
    }
}

/// `DEV_OPS_API_DMA_RESPONSE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaStatus {
    /// All nodes transferred.
    Complete,
    /// Unexpected firmware error.
    UnexpectedError,
    /// Host aborted the transfer.
    HostAborted,
    /// Transfer aborted after an error.
    ErrorAborted,
    /// Address outside the DRAM window.
    InvalidAddress,
    /// Size invalid for the engine.
    InvalidSize,
    /// Any other firmware code.
    Other(u32),
}

impl From<u32> for DmaStatus {
    fn from(raw: u32) -> Self {
        match raw {
            0 => Self::Complete,
            1 => Self::UnexpectedError,
            3 => Self::HostAborted,
            4 => Self::ErrorAborted,
            6 => Self::InvalidAddress,
            7 => Self::InvalidSize,
            other => Self::Other(other),
        }
    }
}

/// Firmware's answer to a DMA read or write list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaListRsp {
    /// Device-side timing.
    pub timing: CommandTiming,
    /// Raw `dev_ops_api_dma_response_e`.
    pub status: u32,
}

impl DmaListRsp {
    /// Typed status.
    #[must_use]
    pub fn dma_status(&self) -> DmaStatus {
        self.status.into()
    }

    /// Encode (device side).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        encode_timed_status(&self.timing, self.status)
    }
}

impl OpsResponse for DmaListRsp {
    const MSG_IDS: &'static [MsgId] = &[MsgId::DmaReadListRsp, MsgId::DmaWriteListRsp];

    fn decode_payload(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            timing: CommandTiming::read(&mut r)?,
            status: r.get_u32()?,
        })
    }

    fn status(&self) -> u32 {
        self.status
    }
}

fn encode_timed_status(timing: &CommandTiming, status: u32) -> Vec<u8> {
    let mut w = Writer::with_capacity(32);
    timing.write(&mut w);
    w.put_u32(status).pad(4);
    w.into_inner()
}

// ── Events ───────────────────────────────────────────────────────────────────

/// `device_ops_device_fw_error_t`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFwErrorEvent {
    /// Error-specific payload.
    pub payload: u64,
    /// Raw `dev_ops_api_error_type_e`.
    pub error_type: u32,
}

impl DeviceFwErrorEvent {
    /// Decode an event payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] for short payloads.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            payload: r.get_u64()?,
            error_type: r.get_u32()?,
        })
    }

    /// Encode (device side).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(16);
        w.put_u64(self.payload).put_u32(self.error_type).pad(4);
        w.into_inner()
    }
}

/// `device_ops_trace_buffer_full_event_t`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceBufferFullEvent {
    /// Bytes of trace data waiting in the buffer.
    pub data_size: u32,
    /// Which trace buffer filled (MM or CM).
    pub buffer_type: u8,
}

impl TraceBufferFullEvent {
    /// Decode an event payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] for short payloads.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            data_size: r.get_u32()?,
            buffer_type: r.get_u8()?,
        })
    }

    /// Encode (device side).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(8);
        w.put_u32(self.data_size).put_u8(self.buffer_type).pad(3);
        w.into_inner()
    }
}
