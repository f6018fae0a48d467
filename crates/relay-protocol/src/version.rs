//! Protocol versioning for safe upgrades.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Protocol version spoken on the local socket.
///
/// Travels as a `"major.minor"` string. Peers are compatible when their
/// major versions match; minor bumps only add optional fields and
/// message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Version implemented by this crate.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Returns true if both sides can talk to each other.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// Checks a peer's version against [`ProtocolVersion::CURRENT`].
    ///
    /// # Errors
    ///
    /// `VersionError::Incompatible` if the major versions differ.
    pub fn check_against_current(&self) -> Result<(), VersionError> {
        if self.is_compatible_with(&Self::CURRENT) {
            Ok(())
        } else {
            Err(VersionError::Incompatible {
                got: *self,
                expected: Self::CURRENT,
            })
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidFormat(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for ProtocolVersion {
    type Error = VersionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ProtocolVersion> for String {
    fn from(v: ProtocolVersion) -> Self {
        v.to_string()
    }
}

/// Errors that can occur with version handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid protocol version {0:?} (expected \"major.minor\")")]
    InvalidFormat(String),

    #[error("protocol version {got} not compatible with {expected}")]
    Incompatible {
        got: ProtocolVersion,
        expected: ProtocolVersion,
    },
}
