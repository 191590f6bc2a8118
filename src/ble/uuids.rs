//! Bluetooth SIG UUID helpers.
//!
//! Short 16- and 32-bit UUIDs are aliases into the Bluetooth Base UUID
//! `0000xxxx-0000-1000-8000-00805f9b34fb`.

use uuid::Uuid;

const BASE: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// The Bluetooth Base UUID.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(BASE);

// Standard services
/// Generic Access service UUID.
pub const GENERIC_ACCESS_SERVICE_UUID: Uuid = from_u16(0x1800);
/// Generic Attribute service UUID.
pub const GENERIC_ATTRIBUTE_SERVICE_UUID: Uuid = from_u16(0x1801);
/// Device Information service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = from_u16(0x180a);
/// Battery service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = from_u16(0x180f);
/// Heart Rate service UUID.
pub const HEART_RATE_SERVICE_UUID: Uuid = from_u16(0x180d);

// Standard characteristics
/// Device Name characteristic UUID.
pub const DEVICE_NAME_UUID: Uuid = from_u16(0x2a00);
/// Battery Level characteristic UUID.
pub const BATTERY_LEVEL_UUID: Uuid = from_u16(0x2a19);
/// Manufacturer Name characteristic UUID.
pub const MANUFACTURER_NAME_UUID: Uuid = from_u16(0x2a29);
/// Firmware Revision characteristic UUID.
pub const FIRMWARE_REVISION_UUID: Uuid = from_u16(0x2a26);

/// Expand a 16-bit SIG UUID.
pub const fn from_u16(short: u16) -> Uuid {
    from_u32(short as u32)
}

/// Expand a 32-bit SIG UUID.
pub const fn from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BASE | ((short as u128) << 96))
}

/// Get the 16-bit alias of a UUID, if it lies in the base range.
pub fn to_u16(uuid: &Uuid) -> Option<u16> {
    to_u32(uuid).and_then(|short| u16::try_from(short).ok())
}

/// Get the 32-bit alias of a UUID, if it lies in the base range.
pub fn to_u32(uuid: &Uuid) -> Option<u32> {
    let value = uuid.as_u128();
    if value & ((1u128 << 96) - 1) == BASE {
        Some((value >> 96) as u32)
    } else {
        None
    }
}
