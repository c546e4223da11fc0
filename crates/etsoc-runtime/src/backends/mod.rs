// SPDX-License-Identifier: AGPL-3.0-only

//! Transport implementations
//!
//! Two transports available:
//! - **Node**: kernel character devices `/dev/et{N}_ops` and `/dev/et{N}_mgmt`
//! - **Emulated**: in-process firmware model for CI and fault injection

pub mod emulated;
pub mod node;

pub use emulated::{EmulatedConfig, EmulatedDevice};
pub use node::{DeviceGeometry, NodeTransport};
