// SPDX-License-Identifier: AGPL-3.0-only

//! Frame headers shared by every command, response, and event.
//!
//! ```text
//! cmn_header_t          { size:u16, tag_id:u16, msg_id:u16 }                     6 B, packed
//! cmd_header_t          { cmn_header_t, flags:u16 }                              8 B
//! rsp_header_t          { cmn_header_t, pad[2] }                                 8 B
//! dev_mgmt_rsp_header_t { cmn_header_t, pad[2], device_latency_usec:u64,
//!                         status:i32, pad[4] }                                   24 B
//! ```
//!
//! Event frames (`evt_header_t`) share the response layout.

use std::ops::{BitOr, BitOrAssign};

use crate::codec::{Reader, Writer};
use crate::error::WireError;

/// Size of `cmn_header_t` in bytes.
pub const CMN_HEADER_SIZE: usize = 6;

/// Size of `cmd_header_t` in bytes.
pub const CMD_HEADER_SIZE: usize = 8;

/// Size of `rsp_header_t` (and `evt_header_t`) in bytes.
pub const RSP_HEADER_SIZE: usize = 8;

/// Size of `dev_mgmt_rsp_header_t` in bytes.
pub const MGMT_RSP_HEADER_SIZE: usize = 24;

/// Alignment every embedded header and payload structure honours.
pub const FRAME_ALIGNMENT: usize = 8;

// ── Common header ────────────────────────────────────────────────────────────

/// `cmn_header_t`: prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmnHeader {
    /// Payload bytes following the enclosing header.
    pub size: u16,
    /// Correlation key between a command and its response.
    pub tag_id: u16,
    /// Message kind; selects payload decoding.
    pub msg_id: u16,
}

impl CmnHeader {
    fn write(&self, w: &mut Writer) {
        w.put_u16(self.size).put_u16(self.tag_id).put_u16(self.msg_id);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            size: r.get_u16()?,
            tag_id: r.get_u16()?,
            msg_id: r.get_u16()?,
        })
    }

    /// Peek the common header of any frame without consuming the rest.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] for frames shorter than 6 bytes.
    pub fn peek(frame: &[u8]) -> Result<Self, WireError> {
        Self::read(&mut Reader::new(frame))
    }
}

// ── Command flags ────────────────────────────────────────────────────────────

/// `cmd_flags_e` bitmask carried in `cmd_header_t::flags`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CmdFlags(pub u16);

impl CmdFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// bit 0: command acts as a barrier in the submission queue.
    pub const BARRIER: Self = Self(1 << 0);
    /// bit 1: user trace configuration present in kernel launch args.
    pub const KERNEL_TRACE: Self = Self(1 << 1);
    /// bit 2: extract the master minion trace buffer.
    pub const MMFW_TRACEBUF: Self = Self(1 << 2);
    /// bit 3: extract the compute minion trace buffer.
    pub const CMFW_TRACEBUF: Self = Self(1 << 3);
    /// bit 4: flush L3 before kernel launch.
    pub const FLUSH_L3: Self = Self(1 << 4);
    /// bit 5: kernel arguments embedded in the launch payload.
    pub const ARGS_EMBEDDED: Self = Self(1 << 5);
    /// bit 6: user stack configuration present in the launch payload.
    pub const USER_STACK_CFG: Self = Self(1 << 6);

    /// True if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit pattern.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }
}

impl BitOr for CmdFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CmdFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ── Command header ───────────────────────────────────────────────────────────

/// `cmd_header_t`: host to device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    /// Common prefix.
    pub common: CmnHeader,
    /// Per-command flags.
    pub flags: CmdFlags,
}

impl CmdHeader {
    /// Decode a command frame into its header and payload.
    ///
    /// Used by device emulation and by tests; the host never receives commands.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is truncated or `size` disagrees with the payload.
    pub fn decode(frame: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let mut r = Reader::new(frame);
        let common = CmnHeader::read(&mut r)?;
        let flags = CmdFlags(r.get_u16()?);
        let payload = split_payload(&r, common.size)?;
        Ok((Self { common, flags }, payload))
    }
}

/// Build a complete command frame: header followed by `payload`.
///
/// # Errors
///
/// Returns [`WireError::PayloadTooLarge`] if `payload` exceeds `u16::MAX` bytes.
pub fn encode_command(
    tag_id: u16,
    msg_id: u16,
    flags: CmdFlags,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    let size = payload_size(payload)?;
    let mut w = Writer::with_capacity(CMD_HEADER_SIZE + payload.len());
    CmnHeader {
        size,
        tag_id,
        msg_id,
    }
    .write(&mut w);
    w.put_u16(flags.bits()).put_slice(payload);
    Ok(w.into_inner())
}

// ── Response header ──────────────────────────────────────────────────────────

/// `rsp_header_t`: device to host (ops channel and events).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RspHeader {
    /// Common prefix.
    pub common: CmnHeader,
}

impl RspHeader {
    /// Decode a response or event frame into its header and payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is truncated or `size` disagrees with the payload.
    pub fn decode(frame: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let mut r = Reader::new(frame);
        let common = CmnHeader::read(&mut r)?;
        r.skip(2)?;
        let payload = split_payload(&r, common.size)?;
        Ok((Self { common }, payload))
    }
}

/// Build a complete ops response (or event) frame.
///
/// # Errors
///
/// Returns [`WireError::PayloadTooLarge`] if `payload` exceeds `u16::MAX` bytes.
pub fn encode_response(tag_id: u16, msg_id: u16, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let size = payload_size(payload)?;
    let mut w = Writer::with_capacity(RSP_HEADER_SIZE + payload.len());
    CmnHeader {
        size,
        tag_id,
        msg_id,
    }
    .write(&mut w);
    w.pad(2).put_slice(payload);
    Ok(w.into_inner())
}

// ── Management response header ───────────────────────────────────────────────

/// `dev_mgmt_rsp_header_t`: service processor to host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MgmtRspHeader {
    /// Common prefix.
    pub common: CmnHeader,
    /// Time the service processor spent on the command.
    pub device_latency_usec: u64,
    /// Command status, zero on success.
    pub status: i32,
}

impl MgmtRspHeader {
    /// Decode a management response frame into its header and payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is truncated or `size` disagrees with the payload.
    pub fn decode(frame: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let mut r = Reader::new(frame);
        let common = CmnHeader::read(&mut r)?;
        r.skip(2)?;
        let device_latency_usec = r.get_u64()?;
        let status = r.get_i32()?;
        r.skip(4)?;
        let payload = split_payload(&r, common.size)?;
        Ok((
            Self {
                common,
                device_latency_usec,
                status,
            },
            payload,
        ))
    }
}

/// Build a complete management response frame.
///
/// # Errors
///
/// Returns [`WireError::PayloadTooLarge`] if `payload` exceeds `u16::MAX` bytes.
pub fn encode_mgmt_response(
    tag_id: u16,
    msg_id: u16,
    device_latency_usec: u64,
    status: i32,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    let size = payload_size(payload)?;
    let mut w = Writer::with_capacity(MGMT_RSP_HEADER_SIZE + payload.len());
    CmnHeader {
        size,
        tag_id,
        msg_id,
    }
    .write(&mut w);
    w.pad(2)
        .put_u64(device_latency_usec)
        .put_i32(status)
        .pad(4)
        .put_slice(payload);
    Ok(w.into_inner())
}

fn payload_size(payload: &[u8]) -> Result<u16, WireError> {
    u16::try_from(payload.len()).map_err(|_| WireError::PayloadTooLarge { len: payload.len() })
}

fn split_payload<'a>(r: &Reader<'a>, declared: u16) -> Result<&'a [u8], WireError> {
    let rest = r.remaining();
    let size = usize::from(declared);
    if rest.len() < size {
        return Err(WireError::SizeMismatch {
            declared,
            actual: rest.len(),
        });
    }
    // Transports may hand back a frame padded to the queue element size.
    Ok(&rest[..size])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_header_is_bit_exact() {
        let frame = encode_command(7, 0x0205, CmdFlags::BARRIER, &[0xAA; 8]).unwrap();
        assert_eq!(&frame[..8], &[8, 0, 7, 0, 0x05, 0x02, 1, 0]);
        assert_eq!(frame.len(), CMD_HEADER_SIZE + 8);
    }

    #[test]
    fn response_header_has_two_pad_bytes() {
        let frame = encode_response(3, 0x0206, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(&frame[6..8], &[0, 0]);
        let (hdr, payload) = RspHeader::decode(&frame).unwrap();
        assert_eq!(hdr.common.tag_id, 3);
        assert_eq!(hdr.common.size, 8);
        assert_eq!(payload, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn mgmt_header_layout() {
        let frame = encode_mgmt_response(9, 14, 1234, -5, &[]).unwrap();
        assert_eq!(frame.len(), MGMT_RSP_HEADER_SIZE);
        assert_eq!(&frame[8..16], &1234u64.to_le_bytes());
        assert_eq!(&frame[16..20], &(-5i32).to_le_bytes());
        let (hdr, payload) = MgmtRspHeader::decode(&frame).unwrap();
        assert_eq!(hdr.device_latency_usec, 1234);
        assert_eq!(hdr.status, -5);
        assert!(payload.is_empty());
    }

    #[test]
    fn declared_size_beyond_frame_is_rejected() {
        let mut frame = encode_response(1, 0x0206, &[0; 8]).unwrap();
        frame.truncate(12);
        assert_eq!(
            RspHeader::decode(&frame),
            Err(WireError::SizeMismatch {
                declared: 8,
                actual: 4
            })
        );
    }

    #[test]
    fn trailing_queue_padding_is_ignored() {
        let mut frame = encode_response(1, 0x0206, &[9; 8]).unwrap();
        frame.extend_from_slice(&[0; 16]);
        let (_, payload) = RspHeader::decode(&frame).unwrap();
        assert_eq!(payload, &[9; 8]);
    }

    #[test]
    fn flags_compose() {
        let flags = CmdFlags::BARRIER | CmdFlags::FLUSH_L3;
        assert!(flags.contains(CmdFlags::FLUSH_L3));
        assert!(!flags.contains(CmdFlags::KERNEL_TRACE));
        assert_eq!(flags.bits(), 0b1_0001);
    }
}
