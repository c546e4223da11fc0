// SPDX-License-Identifier: AGPL-3.0-only

//! Emulated device transport
//!
//! An in-process stand-in for master minion and service processor firmware.
//! Every command is answered synchronously inside `send_command` and the
//! response parked on a per-queue completion list until `receive_response`
//! collects it. This enables:
//!
//! 1. **CI without hardware**: the dispatcher, negotiation and session code
//!    paths run end to end against real wire frames.
//! 2. **Fault injection**: failed sends, silent (hung) firmware, an
//!    unreachable receive path, incompatible API versions, device error
//!    statuses and out-of-order completion.
//!
//! ## Behaviour per message
//!
//! | Command | Response |
//! |---------|----------|
//! | API compatibility | configured API version; status 0, or 1 when rejecting |
//! | Firmware version | configured triple and commit hash |
//! | Echo | word copied back, configured status |
//! | Kernel launch | completed, or invalid address outside DRAM |
//! | DMA read/write list | complete, or invalid address outside DRAM |
//! | Abort, kernel abort, CM reset, trace | status 0 |
//! | Management | same `msg_id`, configured latency and status |
//!
//! With `truncating_responses` every ops payload is cut to a quarter of its
//! length, short of the status word.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use etsoc_api::header::{encode_mgmt_response, encode_response};
use etsoc_api::mgmt::{
    CurrentTemperature, DefaultRsp, DmCmd, FirmwareRevisions, ModulePower, ModuleUptime,
};
use etsoc_api::ops::{
    ApiCompatibilityRsp, CommandTiming, DmaListRsp, DmaWriteListCmd, EchoCmd, EchoRsp, FwVersionCmd,
    FwVersionRsp, KernelLaunchRsp, MsgId, StatusRsp,
};
use etsoc_api::version::HOST_API_VERSION;
use etsoc_api::{ApiVersion, CmdHeader, Reader};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{EtError, Result};
use crate::transport::{CommandSink, DeviceQuery, ResponseSource, TransportType, VirtualQueue};

/// Emulated device behaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatedConfig {
    /// Devices exposed by the transport
    pub devices: usize,
    /// Ops queues per device
    pub ops_queues: usize,
    /// DMA alignment reported
    pub dma_alignment: usize,
    /// Device DRAM window
    pub dram_base: u64,
    /// Device DRAM size
    pub dram_size: u64,
    /// API version reported during negotiation
    pub api_version: ApiVersion,
    /// Refuse the host during negotiation
    pub reject_compatibility: bool,
    /// Master minion firmware triple
    pub fw_version: (u16, u16, u16),
    /// Master minion firmware commit hash
    pub fw_git_hash: u64,
    /// Status word returned in echo responses
    pub echo_status: u32,
    /// Latency reported in management responses
    pub mgmt_latency_usec: u64,
    /// Status reported in management responses
    pub mgmt_status: i32,
    /// Hand back the newest completion first
    pub reorder: bool,
    /// Fail every `send_command`
    pub fail_sends: bool,
    /// Accept commands but never answer
    pub silent: bool,
    /// Cut ops response payloads short of their status word
    pub truncate_responses: bool,
}

impl Default for EmulatedConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            ops_queues: 2,
            dma_alignment: 64,
            dram_base: 0x8000_0000,
            dram_size: 1 << 34,
            api_version: HOST_API_VERSION,
            reject_compatibility: false,
            fw_version: (0, 9, 4),
            fw_git_hash: 0x1a2b_3c4d_5e6f_7081,
            echo_status: 0,
            mgmt_latency_usec: 150,
            mgmt_status: 0,
            reorder: false,
            fail_sends: false,
            silent: false,
            truncate_responses: false,
        }
    }
}

impl EmulatedConfig {
    /// Report `version` during negotiation
    #[must_use]
    pub const fn with_api_version(mut self, version: ApiVersion) -> Self {
        self.api_version = version;
        self
    }

    /// Refuse the host during negotiation
    #[must_use]
    pub const fn rejecting_compatibility(mut self) -> Self {
        self.reject_compatibility = true;
        self
    }

    /// Report `hash` as the firmware commit
    #[must_use]
    pub const fn with_fw_git_hash(mut self, hash: u64) -> Self {
        self.fw_git_hash = hash;
        self
    }

    /// Return `status` in echo responses
    #[must_use]
    pub const fn with_echo_status(mut self, status: u32) -> Self {
        self.echo_status = status;
        self
    }

    /// Return `status` in management responses
    #[must_use]
    pub const fn with_mgmt_status(mut self, status: i32) -> Self {
        self.mgmt_status = status;
        self
    }

    /// Expose `devices` devices
    #[must_use]
    pub const fn with_devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    /// Complete newest-first
    #[must_use]
    pub const fn reordering(mut self) -> Self {
        self.reorder = true;
        self
    }

    /// Fail every send
    #[must_use]
    pub const fn failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    /// Never answer
    #[must_use]
    pub const fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Answer ops commands with payloads too short to decode
    #[must_use]
    pub const fn truncating_responses(mut self) -> Self {
        self.truncate_responses = true;
        self
    }
}

/// In-process device implementing the full transport
#[derive(Debug)]
pub struct EmulatedDevice {
    config: EmulatedConfig,
    completions: Mutex<HashMap<(usize, VirtualQueue), VecDeque<Bytes>>>,
    arrived: Condvar,
    received: Mutex<HashMap<u16, usize>>,
    silent: AtomicBool,
    unreachable: AtomicBool,
    started: Instant,
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedDevice {
    /// Well-behaved device speaking the host's API
    pub fn new() -> Self {
        Self::with_config(EmulatedConfig::default())
    }

    /// Device with explicit behaviour
    pub fn with_config(config: EmulatedConfig) -> Self {
        info!(
            "Emulated device: {} device(s), API {}, DRAM {:#x}+{:#x}",
            config.devices, config.api_version, config.dram_base, config.dram_size
        );
        Self {
            silent: AtomicBool::new(config.silent),
            config,
            completions: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
            received: Mutex::new(HashMap::new()),
            unreachable: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Stop (or resume) answering commands
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Release);
    }

    /// Make `receive_response` fail (or recover)
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Release);
    }

    /// Commands with `msg_id` accepted so far
    pub fn commands_received(&self, msg_id: u16) -> usize {
        self.received.lock().get(&msg_id).copied().unwrap_or(0)
    }

    /// Park an arbitrary ops frame, as if firmware had produced it.
    ///
    /// Used to model stray responses and unsolicited events.
    pub fn inject_response(&self, device: usize, tag_id: u16, msg_id: MsgId, payload: &[u8]) {
        match encode_response(tag_id, msg_id.as_u16(), payload) {
            Ok(frame) => self.complete(device, VirtualQueue::Ops(0), frame),
            Err(e) => warn!("Cannot inject frame: {e}"),
        }
    }

    fn check_device(&self, device: usize) -> Result<()> {
        if device >= self.config.devices {
            return Err(EtError::InvalidIndex {
                index: device,
                count: self.config.devices,
            });
        }
        Ok(())
    }

    fn complete(&self, device: usize, queue: VirtualQueue, frame: Vec<u8>) {
        self.completions
            .lock()
            .entry((device, queue))
            .or_default()
            .push_back(Bytes::from(frame));
        self.arrived.notify_all();
    }

    fn in_dram(&self, addr: u64, size: u64) -> bool {
        let end = self.config.dram_base + self.config.dram_size;
        addr >= self.config.dram_base && addr.checked_add(size).is_some_and(|e| e <= end)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn timestamp(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    fn answer_ops(&self, msg_id: u16, payload: &[u8]) -> Result<Option<(u16, Vec<u8>)>> {
        let Ok(id) = MsgId::from_u16(msg_id) else {
            warn!("Emulated device ignoring unknown msg_id {msg_id}");
            return Ok(None);
        };
        let Some(rsp_id) = id.response_id() else {
            warn!("Emulated device ignoring non-command msg_id {msg_id}");
            return Ok(None);
        };

        let body = match id {
            MsgId::CheckApiCompatibilityCmd => {
                let host = Reader::new(payload).get_u16().unwrap_or(0);
                debug!("Compatibility query from host API major {host}");
                ApiCompatibilityRsp {
                    status: u32::from(self.config.reject_compatibility),
                    device: self.config.api_version,
                }
                .encode_payload()
            }
            MsgId::FwVersionCmd => {
                let cmd = FwVersionCmd::decode_payload(payload)?;
                let (major, minor, patch) = self.config.fw_version;
                FwVersionRsp {
                    status: 0,
                    major,
                    minor,
                    patch,
                    fw_type: cmd.fw_type as u8,
                    git_hash: self.config.fw_git_hash,
                }
                .encode_payload()
            }
            MsgId::EchoCmd => EchoRsp {
                payload: EchoCmd::decode_payload(payload)?.payload,
                device_cmd_start_ts: self.timestamp(),
                status: self.config.echo_status,
            }
            .encode_payload(),
            MsgId::KernelLaunchCmd => {
                let code = Reader::new(payload).get_u64()?;
                KernelLaunchRsp {
                    timing: self.timing(),
                    status: if self.in_dram(code, 1) { 0 } else { 5 },
                }
                .encode_payload()
            }
            MsgId::DmaReadListCmd | MsgId::DmaWriteListCmd => {
                // Read and write nodes share a layout: the device address is the third word.
                let nodes = DmaWriteListCmd::decode_payload(payload)?.nodes;
                let valid = nodes
                    .iter()
                    .all(|n| self.in_dram(n.dst_device_phy_addr, u64::from(n.size)));
                DmaListRsp {
                    timing: self.timing(),
                    status: if valid { 0 } else { 6 },
                }
                .encode_payload()
            }
            _ => StatusRsp { status: 0 }.encode_payload(),
        };
        let mut body = body;
        if self.config.truncate_responses {
            // A quarter of any response stops short of its status word.
            body.truncate(body.len() / 4);
        }
        Ok(Some((rsp_id.as_u16(), body)))
    }

    fn timing(&self) -> CommandTiming {
        CommandTiming {
            start_ts: self.timestamp(),
            execute_dur: 12,
            wait_dur: 3,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn answer_mgmt(&self, msg_id: u16) -> Vec<u8> {
        match DmCmd(msg_id) {
            DmCmd::GET_MODULE_FIRMWARE_REVISIONS => {
                let (major, minor, patch) = self.config.fw_version;
                let mm = (u32::from(major) << 16) | (u32::from(minor) << 8) | u32::from(patch);
                FirmwareRevisions {
                    bl1: 0x0001_0000,
                    bl2: 0x0001_0000,
                    master_minion: mm,
                    worker_minion: mm,
                    machine_minion: mm,
                    release: 1,
                    pmic: 0x0002_0000,
                }
                .encode()
            }
            DmCmd::GET_MODULE_CURRENT_TEMPERATURE => CurrentTemperature {
                ioshire_current: 41,
                ioshire_low: 35,
                ioshire_high: 48,
                minshire_avg: 44,
                minshire_low: 39,
                minshire_high: 52,
                pmic_sys: 38,
            }
            .encode(),
            DmCmd::GET_MODULE_UPTIME => {
                let mins = self.started.elapsed().as_secs() / 60;
                ModuleUptime {
                    days: (mins / (24 * 60)) as u16,
                    hours: ((mins / 60) % 24) as u8,
                    mins: (mins % 60) as u8,
                }
                .encode()
            }
            DmCmd::GET_MODULE_POWER => ModulePower { power: 0x4b }.encode(),
            DmCmd::GET_MODULE_MEMORY_SIZE_MB => DefaultRsp {
                payload: i32::try_from(self.config.dram_size >> 20).unwrap_or(i32::MAX),
            }
            .encode(),
            _ => DefaultRsp { payload: 0 }.encode(),
        }
    }
}

impl CommandSink for EmulatedDevice {
    fn send_command(&self, device: usize, queue: VirtualQueue, frame: &[u8]) -> Result<()> {
        self.check_device(device)?;
        if self.config.fail_sends {
            return Err(EtError::transport("emulated send failure"));
        }
        if let VirtualQueue::Ops(index) = queue {
            if index >= self.config.ops_queues {
                return Err(EtError::InvalidQueue {
                    device,
                    queue: index,
                    count: self.config.ops_queues,
                });
            }
        }

        let (header, payload) = CmdHeader::decode(frame)?;
        let tag_id = header.common.tag_id;
        let msg_id = header.common.msg_id;
        *self.received.lock().entry(msg_id).or_default() += 1;

        if self.silent.load(Ordering::Acquire) {
            debug!("Emulated device silently dropping tag {tag_id} msg_id {msg_id}");
            return Ok(());
        }

        let frame = match queue {
            VirtualQueue::Ops(_) => match self.answer_ops(msg_id, payload)? {
                Some((rsp_id, body)) => encode_response(tag_id, rsp_id, &body)?,
                None => return Ok(()),
            },
            VirtualQueue::Management => encode_mgmt_response(
                tag_id,
                msg_id,
                self.config.mgmt_latency_usec,
                self.config.mgmt_status,
                &self.answer_mgmt(msg_id),
            )?,
        };
        self.complete(device, queue, frame);
        Ok(())
    }
}

impl ResponseSource for EmulatedDevice {
    fn receive_response(
        &self,
        device: usize,
        queue: VirtualQueue,
        timeout: Duration,
    ) -> Result<Option<Bytes>> {
        self.check_device(device)?;
        if self.unreachable.load(Ordering::Acquire) {
            return Err(EtError::transport("emulated device unreachable"));
        }

        let deadline = Instant::now() + timeout;
        let mut completions = self.completions.lock();
        loop {
            if let Some(list) = completions.get_mut(&(device, queue)) {
                let next = if self.config.reorder {
                    list.pop_back()
                } else {
                    list.pop_front()
                };
                if next.is_some() {
                    return Ok(next);
                }
            }
            if self.arrived.wait_until(&mut completions, deadline).timed_out() {
                return Ok(None);
            }
        }
    }
}

impl DeviceQuery for EmulatedDevice {
    fn devices_count(&self) -> usize {
        self.config.devices
    }

    fn virtual_queues_count(&self, device: usize) -> Result<usize> {
        self.check_device(device)?;
        Ok(self.config.ops_queues)
    }

    fn dma_alignment(&self) -> usize {
        self.config.dma_alignment
    }

    fn dram_size(&self) -> u64 {
        self.config.dram_size
    }

    fn dram_base_address(&self) -> u64 {
        self.config.dram_base
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Emulated
    }
}
