// SPDX-License-Identifier: AGPL-3.0-only

//! Runtime device discovery
//!
//! Discovers ETSoC cards by scanning `/dev` for `et{N}_ops` nodes. The
//! matching `et{N}_mgmt` node is recorded when present. No hardcoded device
//! lists.

use std::path::{Path, PathBuf};

use crate::backends::node::NodeTransport;
use crate::error::{EtError, Result};

/// Directory scanned by [`DeviceManager::discover`]
pub const DEV_DIR: &str = "/dev";

/// Device manager for runtime discovery and access
#[derive(Debug)]
pub struct DeviceManager {
    devices: Vec<DeviceInfo>,
}

/// Information about a discovered device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Kernel device number (`N` in `et{N}_ops`)
    pub index: usize,

    /// Ops node path
    pub ops_path: PathBuf,

    /// Management node path, if the driver exposes one
    pub mgmt_path: Option<PathBuf>,
}

impl DeviceManager {
    /// Discover all ETSoC devices on the system
    ///
    /// # Errors
    ///
    /// Returns `EtError::NoDevicesFound` if no devices are detected.
    pub fn discover() -> Result<Self> {
        Self::discover_in(Path::new(DEV_DIR))
    }

    /// Discover devices under `dir` instead of `/dev`
    ///
    /// # Errors
    ///
    /// Returns `EtError::NoDevicesFound` if no `et*_ops` node exists, or an
    /// I/O error if `dir` cannot be read.
    pub fn discover_in(dir: &Path) -> Result<Self> {
        tracing::info!("Discovering ETSoC devices in {}...", dir.display());

        let mut devices = Vec::new();
        for entry in std::fs::read_dir(dir)?.flatten() {
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(parse_ops_node) else {
                continue;
            };

            let ops_path = entry.path();
            let mgmt_path = dir.join(format!("et{index}_mgmt"));
            let mgmt_path = mgmt_path.exists().then_some(mgmt_path);

            tracing::debug!(
                "Found device {index}: {} (mgmt: {})",
                ops_path.display(),
                mgmt_path
                    .as_deref()
                    .map_or_else(|| "none".to_string(), |p| p.display().to_string())
            );

            devices.push(DeviceInfo {
                index,
                ops_path,
                mgmt_path,
            });
        }

        if devices.is_empty() {
            tracing::error!("No ETSoC devices found");
            return Err(EtError::NoDevicesFound);
        }

        devices.sort_by_key(|d| d.index);
        tracing::info!("Discovered {} ETSoC device(s)", devices.len());

        Ok(Self { devices })
    }

    /// Get number of discovered devices
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Get slice of all devices
    #[must_use]
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Get device info by kernel index
    ///
    /// # Errors
    ///
    /// Returns `EtError::InvalidIndex` if no device has that index.
    pub fn device(&self, index: usize) -> Result<&DeviceInfo> {
        self.devices
            .iter()
            .find(|d| d.index == index)
            .ok_or(EtError::InvalidIndex {
                index,
                count: self.devices.len(),
            })
    }

    /// Open every discovered device as one transport.
    ///
    /// Transport device `i` is `self.devices()[i]`.
    ///
    /// # Errors
    ///
    /// Returns an error if any node cannot be opened or rejects a geometry
    /// query.
    pub fn open_transport(&self) -> Result<NodeTransport> {
        NodeTransport::open(&self.devices)
    }
}

fn parse_ops_node(name: &str) -> Option<usize> {
    name.strip_prefix("et")?.strip_suffix("_ops")?.parse().ok()
}
