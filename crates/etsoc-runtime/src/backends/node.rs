// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel node transport
//!
//! Drives the `/dev/et{N}_ops` and `/dev/et{N}_mgmt` character devices of the
//! PCIe driver through its ioctl interface:
//!
//! | Request | Node | Use |
//! |---------|------|-----|
//! | `GET_USER_DRAM_INFO` | ops | DRAM window and DMA alignment, at open |
//! | `GET_SQ_COUNT` | ops | submission queues, at open |
//! | `GET_SQ_MAX_MSG_SIZE` | ops, mgmt | largest frame, at open |
//! | `PUSH_SQ` | ops, mgmt | one command frame onto submission queue `n` |
//! | `POP_CQ` | ops, mgmt | one response frame off completion queue 0 |
//!
//! Every ops submission queue completes into the same completion queue.
//! Tags chosen per queue are rewritten to a device-wide wire tag on push and
//! restored on pop, and each frame is handed to the queue that sent the
//! command. Frames popped on behalf of another queue are parked until that
//! queue's receiver collects them. Events are not tag-routed; whichever ops
//! receiver pops one gets it.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::raw::c_ulong;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use etsoc_api::ops::MsgId;
use etsoc_api::CmnHeader;
use parking_lot::Mutex;
use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::Errno;
use tracing::{debug, info, warn};

use crate::discovery::DeviceInfo;
use crate::error::{EtError, Result};
use crate::transport::{CommandSink, DeviceQuery, ResponseSource, TransportType, VirtualQueue};

/// How long a push waits for room in a full submission queue
const PUSH_RETRY_WINDOW: Duration = Duration::from_secs(1);

/// Byte offset of `cmn_header_t.tag_id`
const TAG_OFFSET: usize = 2;

/// PCIe driver ioctl interface (`et_ioctl.h`)
///
/// Requests use the generic Linux encoding:
/// `dir << 30 | size << 16 | type << 8 | nr`.
mod ioctls {
    use std::mem::size_of;
    use std::os::raw::c_ulong;

    const IOC_WRITE: c_ulong = 1;
    const IOC_READ: c_ulong = 2;

    /// Driver ioctl type byte
    pub const MAGIC: u8 = 0xE7;

    #[allow(clippy::cast_possible_truncation)]
    const fn ioc(dir: c_ulong, nr: u8, size: usize) -> c_ulong {
        (dir << 30) | ((size as c_ulong) << 16) | ((MAGIC as c_ulong) << 8) | nr as c_ulong
    }

    /// `struct dram_info`
    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct DramInfo {
        pub base: u64,
        pub size: u64,
        pub dma_max_elem_size: u32,
        pub dma_max_elem_count: u32,
        pub align_in_bits: u16,
    }

    /// `struct cmd_desc`
    #[repr(C)]
    #[derive(Debug)]
    pub struct CmdDesc {
        pub cmd: *const u8,
        pub size: u16,
        pub sq_index: u16,
        pub flags: u32,
    }

    /// `struct rsp_desc`
    #[repr(C)]
    #[derive(Debug)]
    pub struct RspDesc {
        pub rsp: *mut u8,
        pub size: u16,
        pub cq_index: u16,
    }

    pub const GET_USER_DRAM_INFO: c_ulong = ioc(IOC_READ, 2, size_of::<DramInfo>());
    pub const GET_SQ_COUNT: c_ulong = ioc(IOC_READ, 3, size_of::<u16>());
    pub const GET_SQ_MAX_MSG_SIZE: c_ulong = ioc(IOC_READ, 4, size_of::<u16>());
    pub const PUSH_SQ: c_ulong = ioc(IOC_WRITE, 6, size_of::<CmdDesc>());
    pub const POP_CQ: c_ulong = ioc(IOC_WRITE, 7, size_of::<RspDesc>());
}

/// Issue one driver request.
///
/// # Safety
///
/// `request` must describe an argument of type `T`, and every pointer held
/// in `*arg` must be valid for the access the request performs.
unsafe fn ioctl<T>(file: &File, request: c_ulong, arg: *mut T) -> io::Result<usize> {
    // SAFETY: the fd is open for the life of `file`; the caller vouches for `arg`.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(usize::try_from(ret).unwrap_or_default())
}

fn query_failed(request: &str, path: &Path, err: &io::Error) -> EtError {
    EtError::transport(format!("{request} on {} failed: {err}", path.display()))
}

/// Device facts reported by the driver when the ops node is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    /// Ops submission queues
    pub sq_count: usize,
    /// DMA buffer alignment in bytes
    pub dma_alignment: usize,
    /// Host-usable DRAM window start
    pub dram_base: u64,
    /// Host-usable DRAM window size
    pub dram_size: u64,
    /// Largest ops frame the driver accepts or returns
    pub max_msg_size: usize,
}

impl DeviceGeometry {
    fn query(node: &Node, path: &Path) -> Result<Self> {
        let mut dram = ioctls::DramInfo::default();
        // SAFETY: GET_USER_DRAM_INFO fills one `dram_info`.
        unsafe { ioctl(&node.file, ioctls::GET_USER_DRAM_INFO, &mut dram) }
            .map_err(|e| query_failed("GET_USER_DRAM_INFO", path, &e))?;

        let mut sq_count: u16 = 0;
        // SAFETY: GET_SQ_COUNT writes one u16.
        unsafe { ioctl(&node.file, ioctls::GET_SQ_COUNT, &mut sq_count) }
            .map_err(|e| query_failed("GET_SQ_COUNT", path, &e))?;
        if sq_count == 0 {
            return Err(EtError::transport(format!(
                "{} reports no submission queues",
                path.display()
            )));
        }

        Ok(Self {
            sq_count: usize::from(sq_count),
            dma_alignment: usize::from(dram.align_in_bits / 8).max(1),
            dram_base: dram.base,
            dram_size: dram.size,
            max_msg_size: usize::from(node.max_msg_size),
        })
    }
}

// ── Tag routing ──────────────────────────────────────────────────────────────

/// Maps per-queue tags onto one device-wide wire tag space
#[derive(Debug, Default)]
struct TagRouter {
    next: u16,
    by_wire: HashMap<u16, (usize, u16)>,
    by_origin: HashMap<(usize, u16), u16>,
}

impl TagRouter {
    /// Wire tag for `tag` on `queue`.
    fn assign(&mut self, queue: usize, tag: u16) -> Result<u16> {
        // The queue reused a tag whose command never completed.
        if let Some(stale) = self.by_origin.remove(&(queue, tag)) {
            self.by_wire.remove(&stale);
            debug!("Queue {queue} reused tag {tag}; retiring wire tag {stale}");
        }
        if self.by_wire.len() > usize::from(u16::MAX) {
            return Err(EtError::NoFreeTag {
                pending: self.by_wire.len(),
            });
        }

        let mut wire = self.next;
        while self.by_wire.contains_key(&wire) {
            wire = wire.wrapping_add(1);
        }
        self.next = wire.wrapping_add(1);
        self.by_wire.insert(wire, (queue, tag));
        self.by_origin.insert((queue, tag), wire);
        Ok(wire)
    }

    /// Queue and original tag of a completed wire tag.
    fn resolve(&mut self, wire: u16) -> Option<(usize, u16)> {
        let origin = self.by_wire.remove(&wire)?;
        self.by_origin.remove(&origin);
        Some(origin)
    }

    fn in_flight(&self) -> usize {
        self.by_wire.len()
    }
}

fn set_tag(frame: &mut [u8], tag: u16) {
    if let Some(field) = frame.get_mut(TAG_OFFSET..TAG_OFFSET + 2) {
        field.copy_from_slice(&tag.to_le_bytes());
    }
}

// ── Nodes ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Node {
    file: File,
    max_msg_size: u16,
    pop_lock: Mutex<()>,
}

impl Node {
    fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EtError::device_not_found(path));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;

        let mut max_msg_size: u16 = 0;
        // SAFETY: GET_SQ_MAX_MSG_SIZE writes one u16.
        unsafe { ioctl(&file, ioctls::GET_SQ_MAX_MSG_SIZE, &mut max_msg_size) }
            .map_err(|e| query_failed("GET_SQ_MAX_MSG_SIZE", path, &e))?;
        if max_msg_size == 0 {
            return Err(EtError::transport(format!(
                "{} reports a zero message size",
                path.display()
            )));
        }

        Ok(Self {
            file,
            max_msg_size,
            pop_lock: Mutex::new(()),
        })
    }

    /// Wait for `flags`; `false` on timeout or signal.
    fn wait_ready(&self, flags: PollFlags, timeout: Duration) -> Result<bool> {
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let mut fds = [PollFd::new(&self.file, flags)];
        match poll(&mut fds, timeout_ms) {
            Ok(0) | Err(Errno::INTR) => Ok(false),
            Ok(_) => {
                let revents = fds[0].revents();
                if revents.intersects(PollFlags::ERR | PollFlags::HUP) {
                    return Err(EtError::transport(format!("Device node error: {revents:?}")));
                }
                Ok(true)
            }
            Err(e) => Err(EtError::transport(format!("Poll failed: {e}"))),
        }
    }

    fn push(&self, sq_index: u16, frame: &[u8]) -> Result<()> {
        let size = u16::try_from(frame.len())
            .ok()
            .filter(|&n| n <= self.max_msg_size)
            .ok_or_else(|| {
                EtError::transport(format!(
                    "Frame of {} bytes exceeds the {}-byte queue limit",
                    frame.len(),
                    self.max_msg_size
                ))
            })?;
        let mut desc = ioctls::CmdDesc {
            cmd: frame.as_ptr(),
            size,
            sq_index,
            flags: 0,
        };

        let deadline = Instant::now() + PUSH_RETRY_WINDOW;
        loop {
            // SAFETY: `desc.cmd` points at `frame`, which holds `size` bytes
            // and outlives the call.
            match unsafe { ioctl(&self.file, ioctls::PUSH_SQ, &mut desc) } {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(EtError::transport(format!(
                            "Submission queue {sq_index} stayed full for {PUSH_RETRY_WINDOW:?}"
                        )));
                    }
                    self.wait_ready(PollFlags::OUT, left)?;
                }
                Err(e) => {
                    return Err(EtError::transport(format!(
                        "PUSH_SQ on queue {sq_index} failed: {e}"
                    )))
                }
            }
        }
    }

    /// Pop one frame from completion queue 0. Caller holds `pop_lock`.
    fn pop(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if !self.wait_ready(PollFlags::IN, timeout)? {
            return Ok(None);
        }
        let mut buf = vec![0u8; usize::from(self.max_msg_size)];
        let mut desc = ioctls::RspDesc {
            rsp: buf.as_mut_ptr(),
            size: self.max_msg_size,
            cq_index: 0,
        };
        // SAFETY: `desc.rsp` points at `buf`, which holds `size` writable bytes.
        match unsafe { ioctl(&self.file, ioctls::POP_CQ, &mut desc) } {
            Ok(0) => Ok(None),
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(EtError::transport(format!("POP_CQ failed: {e}"))),
        }
    }
}

#[derive(Debug, Default)]
struct Routing {
    tags: TagRouter,
    parked: HashMap<usize, VecDeque<Bytes>>,
}

#[derive(Debug)]
struct OpsNode {
    node: Node,
    geometry: DeviceGeometry,
    routing: Mutex<Routing>,
}

impl OpsNode {
    fn open(path: &Path) -> Result<Self> {
        let node = Node::open(path)?;
        let geometry = DeviceGeometry::query(&node, path)?;
        Ok(Self {
            node,
            geometry,
            routing: Mutex::new(Routing::default()),
        })
    }

    fn send(&self, queue: usize, frame: &[u8]) -> Result<()> {
        let sq_index = u16::try_from(queue).map_err(|_| {
            EtError::transport(format!("Queue {queue} exceeds the driver's index range"))
        })?;
        let header = CmnHeader::peek(frame)?;
        let wire = self.routing.lock().tags.assign(queue, header.tag_id)?;

        let mut frame = frame.to_vec();
        set_tag(&mut frame, wire);
        if let Err(e) = self.node.push(sq_index, &frame) {
            self.routing.lock().tags.resolve(wire);
            return Err(e);
        }
        Ok(())
    }

    fn take_parked(&self, queue: usize) -> Option<Bytes> {
        self.routing.lock().parked.get_mut(&queue)?.pop_front()
    }

    fn receive(&self, queue: usize, timeout: Duration) -> Result<Option<Bytes>> {
        if let Some(frame) = self.take_parked(queue) {
            return Ok(Some(frame));
        }
        let Some(_popping) = self.node.pop_lock.try_lock_for(timeout) else {
            return Ok(None);
        };
        // Another receiver may have parked a frame for us meanwhile.
        if let Some(frame) = self.take_parked(queue) {
            return Ok(Some(frame));
        }

        let Some(mut frame) = self.node.pop(timeout)? else {
            return Ok(None);
        };
        let Ok(header) = CmnHeader::peek(&frame) else {
            return Ok(Some(Bytes::from(frame)));
        };
        if MsgId::from_u16(header.msg_id).is_ok_and(MsgId::is_event) {
            return Ok(Some(Bytes::from(frame)));
        }

        let mut routing = self.routing.lock();
        let Some((owner, tag)) = routing.tags.resolve(header.tag_id) else {
            drop(routing);
            warn!(
                "Dropping completion with unknown wire tag {} (msg_id {})",
                header.tag_id, header.msg_id
            );
            return Ok(None);
        };
        set_tag(&mut frame, tag);
        let frame = Bytes::from(frame);
        if owner == queue {
            return Ok(Some(frame));
        }
        routing.parked.entry(owner).or_default().push_back(frame);
        Ok(None)
    }
}

#[derive(Debug)]
struct NodeDevice {
    info: DeviceInfo,
    ops: OpsNode,
    mgmt: Option<Node>,
}

/// Transport over kernel character devices
#[derive(Debug)]
pub struct NodeTransport {
    devices: Vec<NodeDevice>,
}

impl NodeTransport {
    /// Open the nodes of every device in `infos` and query their geometry.
    ///
    /// # Errors
    ///
    /// Returns error if a node is missing, cannot be opened, or rejects a
    /// geometry query.
    pub fn open(infos: &[DeviceInfo]) -> Result<Self> {
        let mut devices = Vec::with_capacity(infos.len());
        for info in infos {
            let ops = OpsNode::open(&info.ops_path)?;
            let mgmt = info.mgmt_path.as_deref().map(Node::open).transpose()?;
            let g = &ops.geometry;
            info!(
                "Opened device {}: {}{}, DRAM {:#x}+{:#x}, {} SQ(s), {}-byte frames, {}-byte DMA alignment",
                info.index,
                info.ops_path.display(),
                if mgmt.is_some() { " (+mgmt)" } else { "" },
                g.dram_base,
                g.dram_size,
                g.sq_count,
                g.max_msg_size,
                g.dma_alignment
            );
            devices.push(NodeDevice {
                info: info.clone(),
                ops,
                mgmt,
            });
        }
        Ok(Self { devices })
    }

    /// Discovery record of transport device `device`
    pub fn info(&self, device: usize) -> Option<&DeviceInfo> {
        self.devices.get(device).map(|d| &d.info)
    }

    /// Geometry the driver reported for transport device `device`
    pub fn geometry(&self, device: usize) -> Option<&DeviceGeometry> {
        self.devices.get(device).map(|d| &d.ops.geometry)
    }

    /// Ops commands pushed but not yet completed on `device`
    pub fn in_flight(&self, device: usize) -> usize {
        self.devices
            .get(device)
            .map_or(0, |d| d.ops.routing.lock().tags.in_flight())
    }

    fn device(&self, device: usize) -> Result<&NodeDevice> {
        self.devices.get(device).ok_or(EtError::InvalidIndex {
            index: device,
            count: self.devices.len(),
        })
    }

    fn ops_queue(&self, device: usize, index: usize) -> Result<&OpsNode> {
        let dev = self.device(device)?;
        if index >= dev.ops.geometry.sq_count {
            return Err(EtError::InvalidQueue {
                device,
                queue: index,
                count: dev.ops.geometry.sq_count,
            });
        }
        Ok(&dev.ops)
    }

    fn mgmt(&self, device: usize) -> Result<&Node> {
        self.device(device)?
            .mgmt
            .as_ref()
            .ok_or_else(|| EtError::invalid_state(format!("device {device} has no mgmt node")))
    }

    fn first_geometry(&self) -> Option<&DeviceGeometry> {
        self.geometry(0)
    }
}

impl CommandSink for NodeTransport {
    fn send_command(&self, device: usize, queue: VirtualQueue, frame: &[u8]) -> Result<()> {
        match queue {
            VirtualQueue::Ops(index) => self.ops_queue(device, index)?.send(index, frame),
            VirtualQueue::Management => self.mgmt(device)?.push(0, frame),
        }
    }
}

impl ResponseSource for NodeTransport {
    fn receive_response(
        &self,
        device: usize,
        queue: VirtualQueue,
        timeout: Duration,
    ) -> Result<Option<Bytes>> {
        match queue {
            VirtualQueue::Ops(index) => self.ops_queue(device, index)?.receive(index, timeout),
            VirtualQueue::Management => {
                let node = self.mgmt(device)?;
                let Some(_popping) = node.pop_lock.try_lock_for(timeout) else {
                    return Ok(None);
                };
                Ok(node.pop(timeout)?.map(Bytes::from))
            }
        }
    }
}

impl DeviceQuery for NodeTransport {
    fn devices_count(&self) -> usize {
        self.devices.len()
    }

    fn virtual_queues_count(&self, device: usize) -> Result<usize> {
        Ok(self.device(device)?.ops.geometry.sq_count)
    }

    fn dma_alignment(&self) -> usize {
        self.first_geometry().map_or(1, |g| g.dma_alignment)
    }

    fn dram_size(&self) -> u64 {
        self.first_geometry().map_or(0, |g| g.dram_size)
    }

    fn dram_base_address(&self) -> u64 {
        self.first_geometry().map_or(0, |g| g.dram_base)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Node
    }
}

#[cfg(test)]
mod tests {
    use etsoc_api::header::encode_response;
    use etsoc_api::RspHeader;

    use super::*;
    use crate::DeviceManager;

    #[test]
    fn missing_node_is_device_not_found() {
        let info = DeviceInfo {
            index: 99,
            ops_path: "/nonexistent/et99_ops".into(),
            mgmt_path: None,
        };
        assert!(matches!(
            NodeTransport::open(&[info]),
            Err(EtError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn same_tag_on_two_queues_gets_distinct_wire_tags() {
        let mut router = TagRouter::default();
        let a = router.assign(0, 0).unwrap();
        let b = router.assign(1, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(router.in_flight(), 2);

        assert_eq!(router.resolve(b), Some((1, 0)));
        assert_eq!(router.resolve(a), Some((0, 0)));
        assert_eq!(router.resolve(a), None);
        assert_eq!(router.in_flight(), 0);
    }

    #[test]
    fn reused_tag_retires_stale_wire_tag() {
        let mut router = TagRouter::default();
        let stale = router.assign(0, 5).unwrap();
        let fresh = router.assign(0, 5).unwrap();
        assert_ne!(stale, fresh);
        assert_eq!(router.in_flight(), 1);

        // A late completion for the retired command has nowhere to go.
        assert_eq!(router.resolve(stale), None);
        assert_eq!(router.resolve(fresh), Some((0, 5)));
    }

    #[test]
    fn wire_tags_run_out_at_u16_range() {
        let mut router = TagRouter::default();
        for tag in 0..=u16::MAX {
            router.assign(0, tag).unwrap();
        }
        assert!(matches!(
            router.assign(1, 0),
            Err(EtError::NoFreeTag { pending: 65536 })
        ));
        router.resolve(1234).unwrap();
        assert_eq!(router.assign(1, 0).unwrap(), 1234);
    }

    #[test]
    fn retag_touches_only_the_tag_field() {
        let mut frame = encode_response(7, MsgId::EchoRsp.as_u16(), &[0xAB; 24]).unwrap();
        set_tag(&mut frame, 0x1234);
        let (hdr, payload) = RspHeader::decode(&frame).unwrap();
        assert_eq!(hdr.common.tag_id, 0x1234);
        assert_eq!(hdr.common.msg_id, MsgId::EchoRsp.as_u16());
        assert_eq!(payload, &[0xAB; 24]);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn request_codes_carry_argument_sizes() {
        let size = |request: c_ulong| (request >> 16) & 0x3fff;
        assert_eq!(size(ioctls::GET_USER_DRAM_INFO), 32);
        assert_eq!(size(ioctls::GET_SQ_COUNT), 2);
        assert_eq!(size(ioctls::PUSH_SQ), 16);
        assert_eq!(size(ioctls::POP_CQ), 16);
        assert_eq!((ioctls::PUSH_SQ >> 8) & 0xff, c_ulong::from(ioctls::MAGIC));
        assert_eq!(ioctls::PUSH_SQ >> 30, 1);
        assert_eq!(ioctls::GET_SQ_COUNT >> 30, 2);
    }

    #[test]
    fn test_node_open() {
        let Ok(manager) = DeviceManager::discover() else {
            println!("ℹ️  Skipping test (no hardware)");
            return;
        };
        let transport = manager.open_transport().unwrap();
        for device in 0..transport.devices_count() {
            let geometry = transport.geometry(device).unwrap();
            assert!(geometry.sq_count > 0);
            assert!(geometry.dram_size > 0);
            println!("✅ Device {device}: {geometry:?}");
        }
    }
}
