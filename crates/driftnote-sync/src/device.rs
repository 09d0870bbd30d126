//! DeviceId: stable identifier for a device participating in sync.
//!
//! Generated once on first run and persisted; every outgoing mutation and
//! every realtime event is stamped with the originating device's id so a
//! device can recognize and discard echoes of its own writes.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceIdError {
    #[error("Invalid device ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// A stable identifier for a device participating in sync.
///
/// Wraps a u64 internally but displays as a 16-character hex string for
/// human readability in logs and persisted state.
///
/// # Examples
/// ```
/// use driftnote_sync::DeviceId;
///
/// let device_id = DeviceId::generate();
/// println!("{}", device_id);  // "a1b2c3d4e5f67890"
///
/// let parsed: DeviceId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    /// Generate a new random device ID.
    ///
    /// Uses cryptographically secure randomness. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    /// Get the underlying u64 value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)
                .map_err(DeviceIdError::InvalidHex)?;
            return Ok(Self(id));
        }

        Err(DeviceIdError::InvalidFormat)
    }
}

impl From<u64> for DeviceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<DeviceId> for u64 {
    fn from(device_id: DeviceId) -> u64 {
        device_id.0
    }
}

// Serialize as hex string for consistency in logs, errors, JSON
impl serde::Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_hex() {
        let device_id = DeviceId(0xa1b2c3d4e5f67890);
        assert_eq!(device_id.to_string(), "a1b2c3d4e5f67890");
    }

    #[test]
    fn test_display_zero_padded() {
        let device_id = DeviceId(0xff);
        assert_eq!(device_id.to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_hex() {
        let device_id: DeviceId = "a1b2c3d4e5f67890".parse().unwrap();
        assert_eq!(device_id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_parse_uppercase_hex() {
        let device_id: DeviceId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(device_id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_roundtrip() {
        let original = DeviceId::generate();
        let serialized = original.to_string();
        let parsed: DeviceId = serialized.parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_invalid_format() {
        assert!("too_short".parse::<DeviceId>().is_err());
        assert!("not-a-valid-format-at-all".parse::<DeviceId>().is_err());
        assert!("ghijklmnopqrstuv".parse::<DeviceId>().is_err()); // non-hex
    }

    #[test]
    fn test_generate_not_zero() {
        // Generate many and ensure none are zero
        for _ in 0..1000 {
            assert_ne!(DeviceId::generate().as_u64(), 0);
        }
    }

    #[test]
    fn test_reject_wrong_length() {
        assert!("a1b2c3d4e5f6789".parse::<DeviceId>().is_err()); // 15 chars
        assert!("a1b2c3d4e5f678901".parse::<DeviceId>().is_err()); // 17 chars
        assert!("".parse::<DeviceId>().is_err()); // empty
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = DeviceId::generate();
        let json = serde_json::to_string(&original).unwrap();
        let parsed: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_serde_as_string() {
        let device_id = DeviceId(0xff);
        let json = serde_json::to_string(&device_id).unwrap();
        assert_eq!(json, "\"00000000000000ff\"");
    }
}
