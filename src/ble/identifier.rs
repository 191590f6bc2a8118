//! Device identifiers.
//!
//! A device is addressed either by its 48-bit Bluetooth address or, on
//! platforms that hide addresses (macOS), by an opaque platform UUID.

use std::fmt;
use std::str::FromStr;

use btleplug::api::BDAddr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque, immutable key for a BLE device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceIdentifier {
    /// 48-bit device address, most significant byte first.
    Address([u8; 6]),
    /// Platform-assigned UUID.
    Uuid(Uuid),
}

impl DeviceIdentifier {
    /// Create an identifier from a 48-bit address.
    pub const fn from_address(address: [u8; 6]) -> Self {
        Self::Address(address)
    }

    /// Get the 48-bit address, if this identifier carries one.
    ///
    /// Platform UUIDs in the `00000000-0000-0000-0000-xxxxxxxxxxxx` form
    /// embed an address in their last six bytes and are unwrapped too.
    pub fn address(&self) -> Option<[u8; 6]> {
        match self {
            Self::Address(address) => Some(*address),
            Self::Uuid(uuid) => {
                let bytes = uuid.as_bytes();
                if bytes[..10].iter().all(|b| *b == 0) {
                    let mut address = [0u8; 6];
                    address.copy_from_slice(&bytes[10..]);
                    Some(address)
                } else {
                    None
                }
            }
        }
    }

    /// Convert to the platform GUID form.
    ///
    /// Addresses map to `00000000-0000-0000-0000-aabbccddeeff`.
    pub fn to_uuid(&self) -> Uuid {
        match self {
            Self::Address(address) => {
                let mut bytes = [0u8; 16];
                bytes[10..].copy_from_slice(address);
                Uuid::from_bytes(bytes)
            }
            Self::Uuid(uuid) => *uuid,
        }
    }

    /// Format the address as 12 upper-case hex characters without separators.
    ///
    /// Returns `None` for identifiers that carry no address.
    pub fn to_hex_address(&self) -> Option<String> {
        self.address()
            .map(|a| a.iter().map(|b| format!("{:02X}", b)).collect())
    }

    fn parse_address(s: &str) -> Option<[u8; 6]> {
        let hex: String = if s.len() == 17 {
            let parts: Vec<&str> = s.split([':', '-']).collect();
            if parts.len() != 6 || parts.iter().any(|p| p.len() != 2) {
                return None;
            }
            parts.concat()
        } else if s.len() == 12 {
            s.to_string()
        } else {
            return None;
        };

        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }

        let mut address = [0u8; 6];
        for (i, byte) in address.iter_mut().enumerate() {
            *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(address)
    }
}

impl FromStr for DeviceIdentifier {
    type Err = Error;

    /// Parses `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF`, bare `AABBCCDDEEFF`
    /// or any hyphenated UUID.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(address) = Self::parse_address(s) {
            return Ok(Self::Address(address));
        }
        Uuid::parse_str(s)
            .map(Self::Uuid)
            .map_err(|_| Error::InvalidIdentifier {
                input: s.to_string(),
            })
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(a) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                a[0], a[1], a[2], a[3], a[4], a[5]
            ),
            Self::Uuid(uuid) => write!(f, "{}", uuid),
        }
    }
}

impl From<BDAddr> for DeviceIdentifier {
    fn from(addr: BDAddr) -> Self {
        Self::Address(addr.into_inner())
    }
}

impl From<Uuid> for DeviceIdentifier {
    fn from(uuid: Uuid) -> Self {
        Self::Uuid(uuid)
    }
}
