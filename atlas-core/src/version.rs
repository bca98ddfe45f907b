//! Protocol version gate for peer discovery.
//!
//! Peers advertise a dotted-triple server version in `getinfo`; nodes older
//! than [`MIN_PROTOCOL_VERSION`] predate the replication protocol and are
//! not added to the peer set.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Oldest server version that speaks the replication protocol.
pub const MIN_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion {
    major: 0,
    minor: 14,
    patch: 0,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid version string: {0}")]
pub struct VersionParseError(pub String);

/// A dotted-triple server version, e.g. "0.14.2".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl PartialOrd for ProtocolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProtocolVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // tolerate a pre-release suffix on the patch component ("0.14.0-rc1")
        let mut parts = s.trim().splitn(3, '.');
        let mut next = |last: bool| -> Result<u32, VersionParseError> {
            let part = parts.next().ok_or_else(|| VersionParseError(s.to_string()))?;
            let digits = if last {
                part.split(|c: char| !c.is_ascii_digit()).next().unwrap_or("")
            } else {
                part
            };
            digits.parse().map_err(|_| VersionParseError(s.to_string()))
        };
        Ok(Self {
            major: next(false)?,
            minor: next(false)?,
            patch: next(true)?,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_orders() {
        let old: ProtocolVersion = "0.13.9".parse().unwrap();
        let min: ProtocolVersion = "0.14.0".parse().unwrap();
        let new: ProtocolVersion = "1.0.0".parse().unwrap();
        assert_eq!(min, MIN_PROTOCOL_VERSION);
        assert!(old < MIN_PROTOCOL_VERSION);
        assert!(new > MIN_PROTOCOL_VERSION);
    }

    #[test]
    fn tolerates_prerelease_suffix() {
        let v: ProtocolVersion = "0.14.0-rc1".parse().unwrap();
        assert_eq!(v, MIN_PROTOCOL_VERSION);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<ProtocolVersion>().is_err());
        assert!("1.2".parse::<ProtocolVersion>().is_err());
        assert!("a.b.c".parse::<ProtocolVersion>().is_err());
    }
}
