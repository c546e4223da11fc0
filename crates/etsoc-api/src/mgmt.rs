// SPDX-License-Identifier: AGPL-3.0-only

//! Device-management API: service processor command codes and payloads.
//!
//! Management commands use the ordinary `cmd_header_t`; responses carry the
//! wider `dev_mgmt_rsp_header_t` (see [`crate::header`]), whose `status` and
//! `device_latency_usec` fields are common to every command.

use crate::codec::{Reader, Writer};
use crate::error::WireError;

/// `DM_CMD` command code (also the response `msg_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DmCmd(pub u16);

#[allow(missing_docs)]
impl DmCmd {
    pub const GET_MODULE_MANUFACTURE_NAME: Self = Self(0);
    pub const GET_MODULE_PART_NUMBER: Self = Self(1);
    pub const GET_MODULE_SERIAL_NUMBER: Self = Self(2);
    pub const GET_ASIC_CHIP_REVISION: Self = Self(3);
    pub const GET_MODULE_DRIVER_REVISION: Self = Self(4);
    pub const GET_MODULE_PCIE_ADDR: Self = Self(5);
    pub const GET_MODULE_MEMORY_SIZE_MB: Self = Self(7);
    pub const GET_MODULE_REVISION: Self = Self(8);
    pub const GET_MODULE_MEMORY_TYPE: Self = Self(11);
    pub const GET_MODULE_FIRMWARE_REVISIONS: Self = Self(14);
    pub const SET_FIRMWARE_UPDATE: Self = Self(15);
    pub const GET_FIRMWARE_BOOT_STATUS: Self = Self(16);
    pub const GET_MODULE_TEMPERATURE_THRESHOLDS: Self = Self(21);
    pub const SET_MODULE_TEMPERATURE_THRESHOLDS: Self = Self(22);
    pub const GET_MODULE_POWER_STATE: Self = Self(23);
    pub const GET_MODULE_CURRENT_TEMPERATURE: Self = Self(27);
    pub const GET_MODULE_UPTIME: Self = Self(30);
    pub const GET_MODULE_VOLTAGE: Self = Self(31);
    pub const GET_MODULE_POWER: Self = Self(33);
    pub const GET_MODULE_MAX_TEMPERATURE: Self = Self(38);
    pub const RESET_ETSOC: Self = Self(52);
    pub const GET_ASIC_FREQUENCIES: Self = Self(53);
    pub const GET_MM_ERROR_COUNT: Self = Self(63);
    pub const MM_RESET: Self = Self(64);
    pub const GET_DEVICE_ERROR_EVENTS: Self = Self(65);
    pub const SET_DM_TRACE_RUN_CONTROL: Self = Self(66);
    pub const SET_DM_TRACE_CONFIG: Self = Self(67);

    /// Raw wire value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// True for codes in the management range (below the ops range).
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 < crate::ops::MSG_ID_NONE
    }
}

/// `firmware_version_t`: every firmware image on the module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirmwareRevisions {
    /// BL1 bootloader.
    pub bl1: u32,
    /// BL2 bootloader.
    pub bl2: u32,
    /// Master minion runtime.
    pub master_minion: u32,
    /// Worker minion runtime.
    pub worker_minion: u32,
    /// Machine minion runtime.
    pub machine_minion: u32,
    /// Release revision of the bundle.
    pub release: u32,
    /// PMIC firmware.
    pub pmic: u32,
}

impl FirmwareRevisions {
    /// Encoded size.
    pub const SIZE: usize = 32;

    /// Decode.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] for short payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            bl1: r.get_u32()?,
            bl2: r.get_u32()?,
            master_minion: r.get_u32()?,
            worker_minion: r.get_u32()?,
            machine_minion: r.get_u32()?,
            release: r.get_u32()?,
            pmic: r.get_u32()?,
        })
    }

    /// Encode (device side).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(Self::SIZE);
        w.put_u32(self.bl1)
            .put_u32(self.bl2)
            .put_u32(self.master_minion)
            .put_u32(self.worker_minion)
            .put_u32(self.machine_minion)
            .put_u32(self.release)
            .put_u32(self.pmic)
            .pad(4);
        w.into_inner()
    }
}

/// `current_temperature_t`, degrees Celsius.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CurrentTemperature {
    /// IO shire, now.
    pub ioshire_current: i16,
    /// IO shire, minimum seen.
    pub ioshire_low: i16,
    /// IO shire, maximum seen.
    pub ioshire_high: i16,
    /// Minion shires, average.
    pub minshire_avg: i16,
    /// Minion shires, lowest.
    pub minshire_low: i16,
    /// Minion shires, highest.
    pub minshire_high: i16,
    /// PMIC system sensor.
    pub pmic_sys: u8,
}

impl CurrentTemperature {
    /// Decode.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] for short payloads.
    #[allow(clippy::cast_possible_wrap)]
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let mut next = || r.get_u16().map(|v| v as i16);
        let ioshire_current = next()?;
        let ioshire_low = next()?;
        let ioshire_high = next()?;
        let minshire_avg = next()?;
        let minshire_low = next()?;
        let minshire_high = next()?;
        Ok(Self {
            ioshire_current,
            ioshire_low,
            ioshire_high,
            minshire_avg,
            minshire_low,
            minshire_high,
            pmic_sys: r.get_u8()?,
        })
    }

    /// Encode (device side).
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(16);
        for v in [
            self.ioshire_current,
            self.ioshire_low,
            self.ioshire_high,
            self.minshire_avg,
            self.minshire_low,
            self.minshire_high,
        ] {
            w.put_u16(v as u16);
        }
        w.put_u8(self.pmic_sys).pad(3);
        w.into_inner()
    }
}

/// `module_uptime_t`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleUptime {
    /// Whole days.
    pub days: u16,
    /// Hours past the last day.
    pub hours: u8,
    /// Minutes past the last hour.
    pub mins: u8,
}

impl ModuleUptime {
    /// Decode.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] for short payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            days: r.get_u16()?,
            hours: r.get_u8()?,
            mins: r.get_u8()?,
        })
    }

    /// Encode (device side).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(8);
        w.put_u16(self.days).put_u8(self.hours).put_u8(self.mins).pad(4);
        w.into_inner()
    }
}

/// `module_power_t`: binary-encoded board power.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModulePower {
    /// Raw reading from the power monitor.
    pub power: u16,
}

impl ModulePower {
    /// Decode.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] for short payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            power: Reader::new(payload).get_u16()?,
        })
    }

    /// Encode (device side).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(8);
        w.put_u16(self.power).pad(6);
        w.into_inner()
    }
}

/// `device_mgmt_default_rsp_t`: single signed word for set-style commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultRsp {
    /// Command-specific result.
    pub payload: i32,
}

impl DefaultRsp {
    /// Decode.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] for short payloads.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            payload: Reader::new(payload).get_i32()?,
        })
    }

    /// Encode (device side).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(8);
        w.put_i32(self.payload).pad(4);
        w.into_inner()
    }
}
