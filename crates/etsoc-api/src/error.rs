// SPDX-License-Identifier: AGPL-3.0-only

//! Decode and encode failures for wire frames

use std::fmt;

/// Errors produced while encoding or decoding wire frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Frame ended before the expected field
    Truncated {
        /// Bytes required to finish decoding
        needed: usize,
        /// Bytes actually available
        available: usize,
    },

    /// Payload does not fit in the 16-bit `size` field
    PayloadTooLarge {
        /// Payload length in bytes
        len: usize,
    },

    /// Header `size` disagrees with the bytes that follow it
    SizeMismatch {
        /// Payload size announced by the header
        declared: u16,
        /// Payload bytes present in the frame
        actual: usize,
    },

    /// `msg_id` is outside every known catalog
    UnknownMessage {
        /// Raw message id
        msg_id: u16,
    },

    /// A payload was decoded against the wrong message id
    UnexpectedMessage {
        /// Message id the decoder handles
        expected: u16,
        /// Message id found in the header
        found: u16,
    },

    /// A list payload carries more nodes than firmware accepts
    TooManyNodes {
        /// Nodes supplied
        count: usize,
        /// Firmware maximum
        max: usize,
    },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "frame truncated: need {needed} bytes, have {available}")
            }
            Self::PayloadTooLarge { len } => {
                write!(f, "payload of {len} bytes exceeds u16 size field")
            }
            Self::SizeMismatch { declared, actual } => {
                write!(f, "header declares {declared} payload bytes, frame carries {actual}")
            }
            Self::UnknownMessage { msg_id } => write!(f, "unknown msg_id {msg_id}"),
            Self::UnexpectedMessage { expected, found } => {
                write!(f, "expected msg_id {expected}, found {found}")
            }
            Self::TooManyNodes { count, max } => {
                write!(f, "{count} list nodes exceeds firmware maximum of {max}")
            }
        }
    }
}

impl std::error::Error for WireError {}
