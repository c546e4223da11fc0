// SPDX-License-Identifier: AGPL-3.0-only

//! Firmware version negotiation
//!
//! Two per-session checkers, each querying the device at most once:
//!
//! | Checker | Query | Cached | Role |
//! |---------|-------|--------|------|
//! | [`GitVersionChecker`] | firmware version | firmware triple + commit hash | diagnostics |
//! | [`DeviceApiChecker`] | API compatibility | device API version + accept flag | gates protocol traffic |
//!
//! Compatibility policy: same major, device minor no newer than the host's.
//! Anything unknown (query not run, device refused) is incompatible.

use std::time::Duration;

use etsoc_api::ops::{ApiCompatibilityCmd, ApiCompatibilityRsp, FwType, FwVersionCmd, FwVersionRsp};
use etsoc_api::ApiVersion;
use parking_lot::Mutex;

use crate::dispatcher::{Command, Dispatcher, ResponseError};
use crate::error::{EtError, Result};

/// Compatibility policy between a host and a device API version
pub const fn is_compatible(host: ApiVersion, device: ApiVersion) -> bool {
    host.major == device.major && device.minor <= host.minor
}

// ── Firmware hash ────────────────────────────────────────────────────────────

/// Caches the firmware version reported by one device
#[derive(Debug)]
pub struct GitVersionChecker {
    fw_type: FwType,
    cached: Mutex<Option<FwVersionRsp>>,
}

impl Default for GitVersionChecker {
    fn default() -> Self {
        Self::new(FwType::MasterMinion)
    }
}

impl GitVersionChecker {
    /// Checker for one firmware component
    pub const fn new(fw_type: FwType) -> Self {
        Self {
            fw_type,
            cached: Mutex::new(None),
        }
    }

    /// Firmware commit hash (first 8 bytes).
    ///
    /// Queries the device on first use only.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails; nothing is cached then.
    pub fn device_fw_hash(&self, dispatcher: &Dispatcher, timeout: Duration) -> Result<u64> {
        self.firmware_version(dispatcher, timeout).map(|v| v.git_hash)
    }

    /// Full firmware version response, queried once.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the device reports a
    /// non-zero status.
    pub fn firmware_version(
        &self,
        dispatcher: &Dispatcher,
        timeout: Duration,
    ) -> Result<FwVersionRsp> {
        let mut cached = self.cached.lock();
        if let Some(version) = *cached {
            return Ok(version);
        }

        let cmd = Command::ops(&FwVersionCmd {
            fw_type: self.fw_type,
        })?;
        let version: FwVersionRsp = dispatcher.call(cmd, timeout)?.decode()?;

        tracing::info!(
            "Device {} firmware {:?} {}.{}.{} ({:016x})",
            dispatcher.device(),
            self.fw_type,
            version.major,
            version.minor,
            version.patch,
            version.git_hash
        );
        *cached = Some(version);
        Ok(version)
    }

    /// Cached hash, without device traffic
    pub fn cached_hash(&self) -> Option<u64> {
        self.cached.lock().map(|v| v.git_hash)
    }
}

// ── API compatibility ────────────────────────────────────────────────────────

/// Outcome of the compatibility query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedVersion {
    /// API version the device implements
    pub device: ApiVersion,
    /// Device accepted the host's version
    pub accepted: bool,
}

/// Queries and caches the device's API version
#[derive(Debug)]
pub struct DeviceApiChecker {
    host: ApiVersion,
    cached: Mutex<Option<NegotiatedVersion>>,
}

impl DeviceApiChecker {
    /// Checker advertising `host` to the device
    pub const fn new(host: ApiVersion) -> Self {
        Self {
            host,
            cached: Mutex::new(None),
        }
    }

    /// Host API version advertised
    pub const fn host(&self) -> ApiVersion {
        self.host
    }

    /// Query the device's API version, or return the cached result.
    ///
    /// A device that answers with a refusal still yields a cached
    /// [`NegotiatedVersion`] with `accepted == false`.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable response arrived; nothing is cached.
    pub fn get_device_api_version(
        &self,
        dispatcher: &Dispatcher,
        timeout: Duration,
    ) -> Result<NegotiatedVersion> {
        let mut cached = self.cached.lock();
        if let Some(negotiated) = *cached {
            return Ok(negotiated);
        }

        let cmd = Command::ops(&ApiCompatibilityCmd { host: self.host })?;
        let rsp = dispatcher
            .submit(cmd)?
            .wait_timeout(timeout)
            .ok_or_else(|| EtError::timeout(timeout))?;

        // A refusal carries a status but is still a well-formed answer.
        let rsp = match rsp.error {
            None | Some(ResponseError::Device { .. }) => rsp,
            Some(_) => rsp.into_result()?,
        };
        let reply: ApiCompatibilityRsp = rsp.decode()?;

        let negotiated = NegotiatedVersion {
            device: reply.device,
            accepted: reply.status == 0,
        };
        if negotiated.accepted {
            tracing::info!(
                "Device {} API {} (host {})",
                dispatcher.device(),
                negotiated.device,
                self.host
            );
        } else {
            tracing::warn!(
                "Device {} refused host API {} ({:?}); device speaks {}",
                dispatcher.device(),
                self.host,
                reply.compatibility(),
                negotiated.device
            );
        }
        *cached = Some(negotiated);
        Ok(negotiated)
    }

    /// Cached negotiation result
    pub fn negotiated(&self) -> Option<NegotiatedVersion> {
        *self.cached.lock()
    }

    /// True only after a successful query that the device accepted and
    /// that passes [`is_compatible`]
    pub fn is_device_supported(&self) -> bool {
        self.negotiated()
            .is_some_and(|n| n.accepted && is_compatible(self.host, n.device))
    }
}
