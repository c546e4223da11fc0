// SPDX-License-Identifier: AGPL-3.0-only

//! Tag-correlated command dispatcher
//!
//! Turns a blocking, tag-addressed transport into per-command futures.
//!
//! ```text
//!  caller ── submit ──► pending[tag] = slot
//!                  └──► CommandQueue ──► tx thread ── send_command ──► device
//!                                                                        │
//!  caller ◄── ResponseFuture ◄── slot ◄── rx thread ◄── receive_response ┘
//!                                          (lookup + remove pending[tag])
//! ```
//!
//! Each tag resolves exactly once: the pending entry is removed under the
//! table lock before its slot is filled. A tag is never handed out while its
//! entry exists. Resolution order follows the device, not submission order.
//! A frame whose `msg_id` does not answer the pending command on its tag is
//! dropped and the entry stays pending.
//!
//! Transport failures, timeouts, shutdown and device-reported failures reach
//! the caller as a [`Response`] carrying a [`ResponseError`]; they are never
//! returned as `Err` from the future.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use etsoc_api::header::{encode_command, MGMT_RSP_HEADER_SIZE, RSP_HEADER_SIZE};
use etsoc_api::ops::{self, MsgId, OpsCommand, OpsResponse};
use etsoc_api::{CmdFlags, MgmtRspHeader, RspHeader, WireError};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::command_queue::CommandQueue;
use crate::config::DispatcherConfig;
use crate::error::{EtError, Result};
use crate::transport::{DeviceTransport, VirtualQueue};

// ── Command ──────────────────────────────────────────────────────────────────

/// Request to submit: message id, flags, payload and an optional fixed tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    tag_id: Option<u16>,
    msg_id: u16,
    flags: CmdFlags,
    payload: Bytes,
}

impl Command {
    /// Raw command; the dispatcher assigns the tag
    pub fn new(msg_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            tag_id: None,
            msg_id,
            flags: CmdFlags::NONE,
            payload: payload.into(),
        }
    }

    /// Typed device-ops command.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if the payload violates a firmware limit.
    pub fn ops<C: OpsCommand>(cmd: &C) -> std::result::Result<Self, WireError> {
        Ok(Self::new(C::MSG_ID.as_u16(), cmd.encode_payload()?))
    }

    /// Use a caller-chosen tag instead of an assigned one
    #[must_use]
    pub const fn with_tag(mut self, tag_id: u16) -> Self {
        self.tag_id = Some(tag_id);
        self
    }

    /// Set header flags
    #[must_use]
    pub const fn with_flags(mut self, flags: CmdFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Message id
    pub const fn msg_id(&self) -> u16 {
        self.msg_id
    }

    /// Caller-chosen tag, if any
    pub const fn tag_id(&self) -> Option<u16> {
        self.tag_id
    }

    /// Payload bytes (without header)
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// Why a command did not complete normally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    /// Transport refused the command frame
    SendFailed(String),
    /// No response within the dispatcher's response timeout
    Timeout,
    /// Receive path failed; device presumed unreachable
    Unreachable(String),
    /// Dispatcher shut down with the command outstanding
    Shutdown,
    /// Device answered with a non-zero status
    Device {
        /// Raw status (ops status word or management header status)
        status: i64,
    },
    /// Response id carries a status but the payload could not be decoded
    Malformed(WireError),
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SendFailed(reason) => write!(f, "send failed: {reason}"),
            Self::Timeout => write!(f, "timed out"),
            Self::Unreachable(reason) => write!(f, "device unreachable: {reason}"),
            Self::Shutdown => write!(f, "dispatcher shut down"),
            Self::Device { status } => write!(f, "device status {status}"),
            Self::Malformed(e) => write!(f, "malformed response: {e}"),
        }
    }
}

/// Outcome of one command
#[derive(Debug, Clone)]
pub struct Response {
    /// Tag shared with the command
    pub tag_id: u16,
    /// Response message id (the command's id if no frame arrived)
    pub msg_id: u16,
    /// Failure kind, `None` on success
    pub error: Option<ResponseError>,
    /// Time the device spent on the command (management queue only)
    pub device_latency_usec: Option<u64>,
    /// Submit-to-resolve time measured on the host
    pub host_latency: Duration,
    /// When the response was produced
    pub created: Instant,
    /// Payload following the response header
    pub payload: Bytes,
}

impl Response {
    fn failed(tag_id: u16, msg_id: u16, submitted: Instant, error: ResponseError) -> Self {
        let created = Instant::now();
        Self {
            tag_id,
            msg_id,
            error: Some(error),
            device_latency_usec: None,
            host_latency: created.duration_since(submitted),
            created,
            payload: Bytes::new(),
        }
    }

    /// True if the command completed and the device reported success
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Convert a failed response into an error.
    ///
    /// # Errors
    ///
    /// Returns the [`EtError`] matching [`Response::error`].
    pub fn into_result(self) -> Result<Self> {
        match &self.error {
            None => Ok(self),
            Some(ResponseError::SendFailed(reason)) => Err(EtError::transport(reason.clone())),
            Some(ResponseError::Unreachable(reason)) => Err(EtError::transport(reason.clone())),
            Some(ResponseError::Timeout) => Err(EtError::timeout(self.host_latency)),
            Some(ResponseError::Shutdown) => Err(EtError::invalid_state("dispatcher shut down")),
            Some(ResponseError::Device { status }) => Err(EtError::DeviceStatus {
                msg_id: self.msg_id,
                status: *status,
            }),
            Some(ResponseError::Malformed(e)) => Err(EtError::Protocol { source: e.clone() }),
        }
    }

    /// Decode the payload as a typed ops response.
    ///
    /// Works on failed device responses too, so callers can inspect the
    /// device's status and timing.
    ///
    /// # Errors
    ///
    /// Returns [`EtError::Protocol`] if `msg_id` does not match `R` or the
    /// payload is short.
    pub fn decode<R: OpsResponse>(&self) -> Result<R> {
        if !R::MSG_IDS.iter().any(|id| id.as_u16() == self.msg_id) {
            return Err(WireError::UnexpectedMessage {
                expected: R::MSG_IDS.first().map_or(0, |id| id.as_u16()),
                found: self.msg_id,
            }
            .into());
        }
        Ok(R::decode_payload(&self.payload)?)
    }
}

/// Single-assignment slot for one command's [`Response`]
#[derive(Debug)]
pub struct ResponseFuture {
    tag_id: u16,
    msg_id: u16,
    submitted: Instant,
    slot: Receiver<Response>,
}

impl ResponseFuture {
    /// Tag assigned to the command
    pub const fn tag_id(&self) -> u16 {
        self.tag_id
    }

    /// Block until the command resolves.
    pub fn wait(self) -> Response {
        self.slot
            .recv()
            .unwrap_or_else(|_| self.lost())
    }

    /// Block up to `timeout`; `None` if still unresolved.
    ///
    /// The command stays pending; waiting again is allowed.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Response> {
        match self.slot.recv_timeout(timeout) {
            Ok(rsp) => Some(rsp),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(self.lost()),
        }
    }

    /// Non-blocking poll.
    pub fn try_get(&self) -> Option<Response> {
        self.slot.try_recv().ok()
    }

    // Sender dropped without resolving: only possible if the dispatcher died.
    fn lost(&self) -> Response {
        Response::failed(self.tag_id, self.msg_id, self.submitted, ResponseError::Shutdown)
    }
}

/// Unsolicited device-to-host frame
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    /// Event kind
    pub msg_id: MsgId,
    /// Payload following the header
    pub payload: Bytes,
    /// Arrival time
    pub received: Instant,
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

struct Pending {
    msg_id: u16,
    submitted: Instant,
    slot: Sender<Response>,
}

struct Outgoing {
    tag_id: u16,
    msg_id: u16,
    frame: Vec<u8>,
}

struct Inner {
    transport: Arc<dyn DeviceTransport>,
    device: usize,
    queue: VirtualQueue,
    config: DispatcherConfig,
    pending: Mutex<HashMap<u16, Pending>>,
    commands: CommandQueue<Outgoing>,
    next_tag: AtomicU16,
    running: AtomicBool,
    events: Mutex<Option<Sender<DeviceEvent>>>,
}

/// Per-queue correlator with one send thread and one receive thread
pub struct Dispatcher {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("device", &self.inner.device)
            .field("queue", &self.inner.queue)
            .field("pending", &self.pending_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Dispatcher {
    /// Start the send and receive threads for `(device, queue)`.
    ///
    /// # Errors
    ///
    /// Returns error if the device or queue does not exist, or a thread
    /// cannot be spawned.
    pub fn start(
        transport: Arc<dyn DeviceTransport>,
        device: usize,
        queue: VirtualQueue,
        config: DispatcherConfig,
    ) -> Result<Self> {
        let devices = transport.devices_count();
        if device >= devices {
            return Err(EtError::InvalidIndex {
                index: device,
                count: devices,
            });
        }
        if let VirtualQueue::Ops(index) = queue {
            let count = transport.virtual_queues_count(device)?;
            if index >= count {
                return Err(EtError::InvalidQueue {
                    device,
                    queue: index,
                    count,
                });
            }
        }

        let inner = Arc::new(Inner {
            transport,
            device,
            queue,
            config,
            pending: Mutex::new(HashMap::new()),
            commands: CommandQueue::new(),
            next_tag: AtomicU16::new(0),
            running: AtomicBool::new(true),
            events: Mutex::new(None),
        });

        let dispatcher = Self {
            inner,
            threads: Mutex::new(Vec::with_capacity(2)),
        };

        let tx = Arc::clone(&dispatcher.inner);
        dispatcher.spawn(format!("et{device}-{queue}-tx"), move || tx.dispatch_loop())?;
        let rx = Arc::clone(&dispatcher.inner);
        dispatcher.spawn(format!("et{device}-{queue}-rx"), move || rx.receive_loop())?;

        info!(
            "Dispatcher started: device {device} {queue} via {}",
            dispatcher.inner.transport.transport_type()
        );
        Ok(dispatcher)
    }

    fn spawn(&self, name: String, f: impl FnOnce() + Send + 'static) -> Result<()> {
        match thread::Builder::new().name(name).spawn(f) {
            Ok(handle) => {
                self.threads.lock().push(handle);
                Ok(())
            }
            Err(e) => {
                self.shutdown();
                Err(e.into())
            }
        }
    }

    /// Register a command and queue it for sending.
    ///
    /// # Errors
    ///
    /// Returns [`EtError::TagInUse`] for a caller tag still pending,
    /// [`EtError::NoFreeTag`] when every tag is pending,
    /// [`EtError::Protocol`] if the frame cannot be encoded, and
    /// [`EtError::InvalidState`] after shutdown.
    pub fn submit(&self, command: Command) -> Result<ResponseFuture> {
        let inner = &self.inner;
        if !inner.running.load(Ordering::Acquire) {
            return Err(EtError::invalid_state("dispatcher is shut down"));
        }

        // Encode with a placeholder tag so the table lock is not held while encoding.
        let mut frame = encode_command(0, command.msg_id, command.flags, &command.payload)?;
        let (slot_tx, slot_rx) = bounded(1);
        let submitted = Instant::now();

        let tag_id = {
            let mut pending = inner.pending.lock();
            let tag_id = match command.tag_id {
                Some(tag) if pending.contains_key(&tag) => {
                    return Err(EtError::TagInUse { tag_id: tag });
                }
                Some(tag) => tag,
                None => inner.allocate_tag(&pending)?,
            };
            pending.insert(
                tag_id,
                Pending {
                    msg_id: command.msg_id,
                    submitted,
                    slot: slot_tx,
                },
            );
            tag_id
        };
        frame[2..4].copy_from_slice(&tag_id.to_le_bytes());

        let outgoing = Outgoing {
            tag_id,
            msg_id: command.msg_id,
            frame,
        };
        if inner.commands.push(outgoing).is_err() {
            inner.pending.lock().remove(&tag_id);
            return Err(EtError::invalid_state("dispatcher is shut down"));
        }

        trace!("Queued tag {tag_id} msg_id {} on {}", command.msg_id, inner.queue);
        Ok(ResponseFuture {
            tag_id,
            msg_id: command.msg_id,
            submitted,
            slot: slot_rx,
        })
    }

    /// Submit and block for the response, up to `timeout`.
    ///
    /// On timeout the command stays pending on the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns submit errors, [`EtError::Timeout`] if nothing arrived in
    /// time, or the error carried by the response.
    pub fn call(&self, command: Command, timeout: Duration) -> Result<Response> {
        let future = self.submit(command)?;
        future
            .wait_timeout(timeout)
            .ok_or_else(|| EtError::timeout(timeout))?
            .into_result()
    }

    /// Receive unsolicited device events from now on.
    ///
    /// Replaces any earlier subscription.
    pub fn subscribe_events(&self) -> Receiver<DeviceEvent> {
        let (tx, rx) = unbounded();
        *self.inner.events.lock() = Some(tx);
        rx
    }

    /// Commands registered and not yet resolved
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// False after [`shutdown`](Self::shutdown)
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Device index
    pub fn device(&self) -> usize {
        self.inner.device
    }

    /// Queue this dispatcher drives
    pub fn queue(&self) -> VirtualQueue {
        self.inner.queue
    }

    /// Stop both threads and resolve everything outstanding with
    /// [`ResponseError::Shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        for unsent in inner.commands.drain() {
            inner.resolve_failed(unsent.tag_id, ResponseError::Shutdown);
        }
        inner.commands.close();

        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                error!("Dispatcher thread panicked on device {}", inner.device);
            }
        }

        let abandoned = inner.fail_all(&ResponseError::Shutdown);
        info!(
            "Dispatcher stopped: device {} {} ({abandoned} pending resolved as shutdown)",
            inner.device, inner.queue
        );
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn allocate_tag(&self, pending: &HashMap<u16, Pending>) -> Result<u16> {
        if pending.len() > usize::from(u16::MAX) {
            return Err(EtError::NoFreeTag {
                pending: pending.len(),
            });
        }
        loop {
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&tag) {
                return Ok(tag);
            }
        }
    }

    fn dispatch_loop(&self) {
        while let Some(out) = self.commands.pop() {
            match self.transport.send_command(self.device, self.queue, &out.frame) {
                Ok(()) => trace!("Sent tag {} msg_id {}", out.tag_id, out.msg_id),
                Err(e) => {
                    warn!(
                        "Send failed on device {} {} for tag {}: {e}",
                        self.device, self.queue, out.tag_id
                    );
                    self.resolve_failed(out.tag_id, ResponseError::SendFailed(e.to_string()));
                }
            }
        }
        debug!("Dispatch loop exiting: device {} {}", self.device, self.queue);
    }

    fn receive_loop(&self) {
        let poll = self.config.poll_interval;
        while self.running.load(Ordering::Acquire) {
            match self.transport.receive_response(self.device, self.queue, poll) {
                Ok(Some(frame)) => self.handle_frame(&frame),
                Ok(None) => {}
                Err(e) => {
                    let failed = self.fail_all(&ResponseError::Unreachable(e.to_string()));
                    error!(
                        "Receive failed on device {} {}: {e} ({failed} pending failed)",
                        self.device, self.queue
                    );
                    thread::sleep(poll);
                }
            }
            if let Some(timeout) = self.config.response_timeout {
                self.sweep_expired(timeout);
            }
        }
        debug!("Receive loop exiting: device {} {}", self.device, self.queue);
    }

    fn handle_frame(&self, frame: &Bytes) {
        let decoded = match self.queue {
            VirtualQueue::Ops(_) => RspHeader::decode(frame).map(|(hdr, payload)| {
                (hdr.common, payload.len(), RSP_HEADER_SIZE, None, 0)
            }),
            VirtualQueue::Management => MgmtRspHeader::decode(frame).map(|(hdr, payload)| {
                (
                    hdr.common,
                    payload.len(),
                    MGMT_RSP_HEADER_SIZE,
                    Some(hdr.device_latency_usec),
                    i64::from(hdr.status),
                )
            }),
        };
        let (common, len, offset, device_latency_usec, header_status) = match decoded {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Dropping malformed frame on device {} {}: {e}", self.device, self.queue);
                return;
            }
        };
        let payload = frame.slice(offset..offset + len);

        if let VirtualQueue::Ops(_) = self.queue {
            if let Ok(id) = MsgId::from_u16(common.msg_id) {
                if id.is_event() {
                    self.deliver_event(id, payload);
                    return;
                }
            }
        }

        let entry = {
            let mut pending = self.pending.lock();
            let Some(expected) = pending.get(&common.tag_id).map(|p| match self.queue {
                VirtualQueue::Ops(_) => p.msg_id.checked_add(1),
                VirtualQueue::Management => Some(p.msg_id),
            }) else {
                drop(pending);
                warn!(
                    "Dropping response with unknown tag {} (msg_id {}) on device {} {}",
                    common.tag_id, common.msg_id, self.device, self.queue
                );
                return;
            };
            // Late reply to a retired command whose tag has been reused.
            if expected != Some(common.msg_id) {
                drop(pending);
                warn!(
                    "Dropping msg_id {} for tag {} on device {} {}: pending command expects {:?}",
                    common.msg_id, common.tag_id, self.device, self.queue, expected
                );
                return;
            }
            let Some(entry) = pending.remove(&common.tag_id) else {
                return;
            };
            entry
        };

        let error = match self.queue {
            VirtualQueue::Ops(_) => match MsgId::from_u16(common.msg_id) {
                Ok(id) => match ops::response_status(id, &payload) {
                    Ok(status) => device_error(status.map_or(0, i64::from)),
                    Err(e) => {
                        warn!(
                            "Tag {} {id:?} has an undecodable status on device {} {}: {e}",
                            common.tag_id, self.device, self.queue
                        );
                        Some(ResponseError::Malformed(e))
                    }
                },
                Err(_) => None,
            },
            VirtualQueue::Management => device_error(header_status),
        };

        let created = Instant::now();
        let response = Response {
            tag_id: common.tag_id,
            msg_id: common.msg_id,
            error,
            device_latency_usec,
            host_latency: created.duration_since(entry.submitted),
            created,
            payload,
        };
        // A dropped future means the caller stopped waiting.
        let _ = entry.slot.send(response);
    }

    fn deliver_event(&self, msg_id: MsgId, payload: Bytes) {
        info!("Device {} event {msg_id:?} ({} bytes)", self.device, payload.len());
        let mut events = self.events.lock();
        if let Some(sink) = events.as_ref() {
            let event = DeviceEvent {
                msg_id,
                payload,
                received: Instant::now(),
            };
            if sink.send(event).is_err() {
                *events = None;
            }
        }
    }

    fn resolve_failed(&self, tag_id: u16, error: ResponseError) {
        if let Some(entry) = self.pending.lock().remove(&tag_id) {
            let _ = entry
                .slot
                .send(Response::failed(tag_id, entry.msg_id, entry.submitted, error));
        }
    }

    fn fail_all(&self, error: &ResponseError) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (tag_id, entry) in drained {
            let _ = entry.slot.send(Response::failed(
                tag_id,
                entry.msg_id,
                entry.submitted,
                error.clone(),
            ));
        }
        count
    }

    fn sweep_expired(&self, timeout: Duration) {
        let expired: Vec<_> = {
            let mut pending = self.pending.lock();
            let tags: Vec<u16> = pending
                .iter()
                .filter(|(_, p)| p.submitted.elapsed() >= timeout)
                .map(|(&tag, _)| tag)
                .collect();
            tags.into_iter()
                .filter_map(|tag| pending.remove(&tag).map(|p| (tag, p)))
                .collect()
        };
        for (tag_id, entry) in expired {
            warn!(
                "Tag {tag_id} (msg_id {}) timed out after {timeout:?} on device {} {}",
                entry.msg_id, self.device, self.queue
            );
            let _ = entry.slot.send(Response::failed(
                tag_id,
                entry.msg_id,
                entry.submitted,
                ResponseError::Timeout,
            ));
        }
    }
}

fn device_error(status: i64) -> Option<ResponseError> {
    (status != 0).then_some(ResponseError::Device { status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::emulated::{EmulatedConfig, EmulatedDevice};
    use etsoc_api::ops::{EchoCmd, EchoRsp};

    fn start(device: EmulatedDevice, config: DispatcherConfig) -> (Arc<EmulatedDevice>, Dispatcher) {
        let device = Arc::new(device);
        let transport: Arc<dyn DeviceTransport> = device.clone();
        let d = Dispatcher::start(transport, 0, VirtualQueue::Ops(0), config).unwrap();
        (device, d)
    }

    fn echo(word: u64) -> Command {
        Command::ops(&EchoCmd { payload: word }).unwrap()
    }

    #[test]
    fn echo_round_trip() {
        let (_dev, d) = start(EmulatedDevice::new(), DispatcherConfig::default());
        let rsp = d.submit(echo(0xDEAD_BEEF)).unwrap().wait();
        assert!(rsp.is_ok());
        assert_eq!(rsp.msg_id, MsgId::EchoRsp.as_u16());
        assert_eq!(rsp.decode::<EchoRsp>().unwrap().payload, 0xDEAD_BEEF);
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn caller_tag_in_use_is_rejected() {
        let (_dev, d) = start(
            EmulatedDevice::with_config(EmulatedConfig::default().silent()),
            DispatcherConfig::default(),
        );
        let _first = d.submit(echo(1).with_tag(7)).unwrap();
        assert!(matches!(
            d.submit(echo(2).with_tag(7)),
            Err(EtError::TagInUse { tag_id: 7 })
        ));
    }

    #[test]
    fn assigned_tags_skip_pending_ones() {
        let (_dev, d) = start(
            EmulatedDevice::with_config(EmulatedConfig::default().silent()),
            DispatcherConfig::default(),
        );
        let fixed = d.submit(echo(0).with_tag(1)).unwrap();
        let a = d.submit(echo(0)).unwrap();
        let b = d.submit(echo(0)).unwrap();
        assert_eq!(a.tag_id(), 0);
        assert_eq!(b.tag_id(), 2);
        assert_eq!(fixed.tag_id(), 1);
    }

    #[test]
    fn send_failure_resolves_immediately() {
        let (_dev, d) = start(
            EmulatedDevice::with_config(EmulatedConfig::default().failing_sends()),
            DispatcherConfig::default(),
        );
        let rsp = d.submit(echo(1)).unwrap().wait();
        assert!(matches!(rsp.error, Some(ResponseError::SendFailed(_))));
        assert!(rsp.into_result().is_err());
    }

    #[test]
    fn silent_device_times_out_with_policy() {
        let config = DispatcherConfig::default()
            .with_poll_interval(Duration::from_millis(2))
            .with_response_timeout(Duration::from_millis(20));
        let (_dev, d) = start(
            EmulatedDevice::with_config(EmulatedConfig::default().silent()),
            config,
        );
        let rsp = d.submit(echo(1)).unwrap().wait();
        assert_eq!(rsp.error, Some(ResponseError::Timeout));
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn abandoned_command_holds_its_slot_without_policy() {
        let (_dev, d) = start(
            EmulatedDevice::with_config(EmulatedConfig::default().silent()),
            DispatcherConfig::default(),
        );
        let future = d.submit(echo(1)).unwrap();
        assert!(future.wait_timeout(Duration::from_millis(20)).is_none());
        drop(future);
        assert_eq!(d.pending_count(), 1);
    }

    #[test]
    fn shutdown_resolves_outstanding() {
        let (_dev, d) = start(
            EmulatedDevice::with_config(EmulatedConfig::default().silent()),
            DispatcherConfig::default(),
        );
        let future = d.submit(echo(1)).unwrap();
        d.shutdown();
        assert_eq!(future.wait().error, Some(ResponseError::Shutdown));
        assert!(d.submit(echo(2)).is_err());
    }

    #[test]
    fn unknown_tag_is_dropped() {
        let (dev, d) = start(EmulatedDevice::new(), DispatcherConfig::default());
        dev.inject_response(0, 0x4242, MsgId::EchoRsp, &EchoRsp {
            payload: 0,
            device_cmd_start_ts: 0,
            status: 0,
        }
        .encode_payload());
        let rsp = d.submit(echo(5)).unwrap().wait();
        assert_eq!(rsp.decode::<EchoRsp>().unwrap().payload, 5);
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn events_reach_subscriber() {
        let (dev, d) = start(EmulatedDevice::new(), DispatcherConfig::default());
        let events = d.subscribe_events();
        dev.inject_response(0, 0, MsgId::DeviceFwError, &[0; 16]);
        let evt = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(evt.msg_id, MsgId::DeviceFwError);
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn device_status_is_passed_through() {
        let (_dev, d) = start(
            EmulatedDevice::with_config(EmulatedConfig::default().with_echo_status(1)),
            DispatcherConfig::default(),
        );
        let rsp = d.submit(echo(3)).unwrap().wait();
        assert_eq!(rsp.error, Some(ResponseError::Device { status: 1 }));
        // The payload still decodes for inspection.
        assert_eq!(rsp.decode::<EchoRsp>().unwrap().payload, 3);
    }
}
