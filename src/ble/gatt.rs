//! GATT service and characteristic descriptors.
//!
//! Descriptors are plain values produced by service discovery. They belong
//! to the connection session that discovered them.

use uuid::Uuid;

/// GATT characteristic property bits (Bluetooth Core Vol 3, Part G, 3.3.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    /// Broadcast.
    pub const BROADCAST: u8 = 0x01;
    /// Read.
    pub const READ: u8 = 0x02;
    /// Write without response.
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    /// Write.
    pub const WRITE: u8 = 0x08;
    /// Notify.
    pub const NOTIFY: u8 = 0x10;
    /// Indicate.
    pub const INDICATE: u8 = 0x20;
    /// Authenticated signed writes.
    pub const AUTHENTICATED_SIGNED_WRITES: u8 = 0x40;
    /// Extended properties.
    pub const EXTENDED_PROPERTIES: u8 = 0x80;

    /// Check whether every bit in `mask` is set.
    pub fn contains(&self, mask: u8) -> bool {
        self.0 & mask == mask
    }

    /// Check if the characteristic is readable.
    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    /// Check if the characteristic accepts either kind of write.
    pub fn can_write(&self) -> bool {
        self.0 & (Self::WRITE | Self::WRITE_WITHOUT_RESPONSE) != 0
    }

    /// Check if the characteristic can notify or indicate.
    pub fn can_subscribe(&self) -> bool {
        self.0 & (Self::NOTIFY | Self::INDICATE) != 0
    }
}

impl From<btleplug::api::CharPropFlags> for CharacteristicProperties {
    fn from(flags: btleplug::api::CharPropFlags) -> Self {
        Self(flags.bits())
    }
}

/// A characteristic discovered on a connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicDescriptor {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Property bits.
    pub properties: CharacteristicProperties,
}

/// A service discovered on a connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceDescriptor {
    /// Service UUID.
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
    /// Characteristics of the service.
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    /// Create a primary service with no characteristics.
    pub fn primary(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            characteristics: Vec::new(),
        }
    }

    /// Add a characteristic.
    pub fn with_characteristic(mut self, uuid: Uuid, properties: u8) -> Self {
        self.characteristics.push(CharacteristicDescriptor {
            uuid,
            properties: CharacteristicProperties(properties),
        });
        self
    }

    /// Find a characteristic by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

impl From<&btleplug::api::Service> for ServiceDescriptor {
    fn from(service: &btleplug::api::Service) -> Self {
        Self {
            uuid: service.uuid,
            primary: service.primary,
            characteristics: service
                .characteristics
                .iter()
                .map(|c| CharacteristicDescriptor {
                    uuid: c.uuid,
                    properties: c.properties.into(),
                })
                .collect(),
        }
    }
}
