//! Content addresses for zonefiles.
//!
//! A zonefile is an opaque byte body identified by the SHA-256 of its
//! contents. Hashes travel as lowercase hex strings on the wire.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a zonefile hash in bytes.
pub const HASH_LEN: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZonefileHashError {
    #[error("Invalid hash length: expected {HASH_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),
}

/// Content address of a zonefile body.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZonefileHash([u8; HASH_LEN]);

impl ZonefileHash {
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Does `body` hash to this address?
    pub fn matches(&self, body: &[u8]) -> bool {
        hash_zonefile(body) == *self
    }
}

/// Hash a zonefile body into its content address.
pub fn hash_zonefile(body: &[u8]) -> ZonefileHash {
    let digest = Sha256::digest(body);
    let mut bytes = [0u8; HASH_LEN];
    bytes.copy_from_slice(&digest);
    ZonefileHash(bytes)
}

impl fmt::Display for ZonefileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ZonefileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ZonefileHash({})", self)
    }
}

impl FromStr for ZonefileHash {
    type Err = ZonefileHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|e| ZonefileHashError::InvalidHex(e.to_string()))?;
        if raw.len() != HASH_LEN {
            return Err(ZonefileHashError::InvalidLength(raw.len()));
        }
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl Serialize for ZonefileHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ZonefileHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let body = b"$ORIGIN example.id\n$TTL 3600\n";
        let h = hash_zonefile(body);
        assert!(h.matches(body));
        assert!(!h.matches(b"something else"));
    }

    #[test]
    fn hex_round_trip() {
        let h = hash_zonefile(b"abc");
        let parsed: ZonefileHash = h.to_string().parse().unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(matches!(
            "zz".parse::<ZonefileHash>(),
            Err(ZonefileHashError::InvalidHex(_))
        ));
        assert!(matches!(
            "abcd".parse::<ZonefileHash>(),
            Err(ZonefileHashError::InvalidLength(2))
        ));
    }

    #[test]
    fn serde_uses_hex_strings() {
        let h = hash_zonefile(b"abc");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h));
        let back: ZonefileHash = serde_json::from_str(&json).unwrap();
        assert_eq!(h, back);
    }
}
