// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol version identity.
//!
//! The device-ops and management APIs are versioned together: one semantic
//! version triple plus the git hash of the schema the headers were generated
//! from. Firmware reports its own triple and hash during negotiation.

use std::fmt;

/// Semantic version of the device API plus the schema hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiVersion {
    /// Breaking-change counter.
    pub major: u16,
    /// Additive-change counter.
    pub minor: u16,
    /// Fix counter.
    pub patch: u16,
    /// First 8 bytes of the schema commit hash.
    pub schema_hash: u64,
}

impl ApiVersion {
    /// Version triple without a schema hash.
    #[must_use]
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
            schema_hash: 0,
        }
    }

    /// Attach a schema hash.
    #[must_use]
    pub const fn with_hash(mut self, schema_hash: u64) -> Self {
        self.schema_hash = schema_hash;
        self
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.schema_hash != 0 {
            write!(f, "+{:016x}", self.schema_hash)?;
        }
        Ok(())
    }
}

/// API version this host implementation was built against.
pub const HOST_API_VERSION: ApiVersion = ApiVersion {
    major: 1,
    minor: 6,
    patch: 0,
    schema_hash: 0x5e2d_91c4_07ab_3f18,
};
