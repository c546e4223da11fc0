// SPDX-License-Identifier: AGPL-3.0-only

//! Wire model for the ETSoC-1 mailbox protocol.
//!
//! This crate has **no dependencies** and **no device access**. It is a pure
//! model of the bytes exchanged between the host runtime and device firmware:
//! the common frame headers, the message id catalog, command flags, and the
//! per-message payload layouts with their status codes.
//!
//! All structures are little-endian and laid out exactly as the firmware
//! expects them (8-byte aligned, explicit padding).
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`header`] | `cmn_header_t`, `cmd_header_t`, `rsp_header_t`, management response header, frame encode/decode |
//! | [`ops`] | Device-ops message ids (512..1023), payloads, status codes |
//! | [`mgmt`] | Management (service processor) command codes and payloads |
//! | [`version`] | Protocol version triple and the version this host speaks |
//!
//! # Frame layout
//!
//! ```text
//! command  : | size:u16 | tag_id:u16 | msg_id:u16 | flags:u16 | payload[size] |
//! response : | size:u16 | tag_id:u16 | msg_id:u16 | pad[2]    | payload[size] |
//! mgmt rsp : | size:u16 | tag_id:u16 | msg_id:u16 | pad[2] | latency_us:u64 | status:i32 | pad[4] | payload[size] |
//! ```
//!
//! `size` always counts only the payload that follows the header.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod codec;
mod error;
pub mod header;
pub mod mgmt;
pub mod ops;
pub mod version;

pub use codec::{Reader, Writer};
pub use error::WireError;
pub use header::{CmdFlags, CmdHeader, CmnHeader, MgmtRspHeader, RspHeader};
pub use version::{ApiVersion, HOST_API_VERSION};
