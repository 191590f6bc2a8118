//! Advertising data parsing.
//!
//! Splits raw advertising payloads into typed records and deduplicates
//! sightings per device within one scan window.

use bytes::Bytes;
use std::collections::HashMap;
use uuid::Uuid;

use crate::ble::identifier::DeviceIdentifier;
use crate::ble::uuids;
use crate::error::{Error, Result};

/// AD type: incomplete list of 16-bit service UUIDs.
pub const AD_TYPE_INCOMPLETE_UUID16: u8 = 0x02;
/// AD type: complete list of 16-bit service UUIDs.
pub const AD_TYPE_COMPLETE_UUID16: u8 = 0x03;
/// AD type: incomplete list of 32-bit service UUIDs.
pub const AD_TYPE_INCOMPLETE_UUID32: u8 = 0x04;
/// AD type: complete list of 32-bit service UUIDs.
pub const AD_TYPE_COMPLETE_UUID32: u8 = 0x05;
/// AD type: incomplete list of 128-bit service UUIDs.
pub const AD_TYPE_INCOMPLETE_UUID128: u8 = 0x06;
/// AD type: complete list of 128-bit service UUIDs.
pub const AD_TYPE_COMPLETE_UUID128: u8 = 0x07;
/// AD type: complete local name.
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
/// AD type: manufacturer specific data.
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xff;

/// A single typed field of an advertising packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdvertisementRecord {
    /// The device's complete local name.
    CompleteLocalName(String),
    /// Advertised service UUIDs, short forms expanded to 128 bits.
    ServiceUuids(Vec<Uuid>),
    /// Manufacturer specific data.
    ManufacturerData {
        /// Bluetooth SIG company identifier.
        company_id: u16,
        /// Payload following the company identifier.
        data: Bytes,
    },
    /// Any other AD type, kept verbatim.
    Unknown {
        /// The AD type code.
        type_code: u8,
        /// The raw field data.
        data: Bytes,
    },
}

impl AdvertisementRecord {
    /// Get the AD type code for this record.
    ///
    /// Service UUID lists report the complete-list code for their width.
    pub fn type_code(&self) -> u8 {
        match self {
            Self::CompleteLocalName(_) => AD_TYPE_COMPLETE_LOCAL_NAME,
            Self::ServiceUuids(list) => {
                if list.iter().all(|u| uuids::to_u16(u).is_some()) {
                    AD_TYPE_COMPLETE_UUID16
                } else if list.iter().all(|u| uuids::to_u32(u).is_some()) {
                    AD_TYPE_COMPLETE_UUID32
                } else {
                    AD_TYPE_COMPLETE_UUID128
                }
            }
            Self::ManufacturerData { .. } => AD_TYPE_MANUFACTURER_DATA,
            Self::Unknown { type_code, .. } => *type_code,
        }
    }

    /// Parse a complete advertising or scan response payload.
    ///
    /// A zero length byte terminates the payload (the remainder is padding).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidData`] if a field overruns the payload or a
    /// typed field has an impossible length.
    pub fn parse_payload(payload: &[u8]) -> Result<Vec<Self>> {
        let mut records = Vec::new();
        let mut offset = 0;

        while offset < payload.len() {
            let len = payload[offset] as usize;
            if len == 0 {
                break;
            }

            let end = offset + 1 + len;
            if end > payload.len() {
                return Err(Error::InvalidData {
                    context: format!(
                        "AD field at offset {} needs {} bytes, {} available",
                        offset,
                        len,
                        payload.len() - offset - 1
                    ),
                });
            }

            let type_code = payload[offset + 1];
            let data = &payload[offset + 2..end];
            records.push(Self::parse_field(type_code, data)?);

            offset = end;
        }

        Ok(records)
    }

    fn parse_field(type_code: u8, data: &[u8]) -> Result<Self> {
        let record = match type_code {
            AD_TYPE_COMPLETE_LOCAL_NAME => {
                Self::CompleteLocalName(String::from_utf8_lossy(data).into_owned())
            }
            AD_TYPE_INCOMPLETE_UUID16 | AD_TYPE_COMPLETE_UUID16 => {
                Self::ServiceUuids(Self::parse_uuid_list(type_code, data, 2)?)
            }
            AD_TYPE_INCOMPLETE_UUID32 | AD_TYPE_COMPLETE_UUID32 => {
                Self::ServiceUuids(Self::parse_uuid_list(type_code, data, 4)?)
            }
            AD_TYPE_INCOMPLETE_UUID128 | AD_TYPE_COMPLETE_UUID128 => {
                Self::ServiceUuids(Self::parse_uuid_list(type_code, data, 16)?)
            }
            AD_TYPE_MANUFACTURER_DATA => {
                if data.len() < 2 {
                    return Err(Error::InvalidData {
                        context: format!(
                            "Manufacturer data too short: {} bytes (need at least 2)",
                            data.len()
                        ),
                    });
                }
                Self::ManufacturerData {
                    company_id: u16::from_le_bytes([data[0], data[1]]),
                    data: Bytes::copy_from_slice(&data[2..]),
                }
            }
            _ => Self::Unknown {
                type_code,
                data: Bytes::copy_from_slice(data),
            },
        };
        Ok(record)
    }

    fn parse_uuid_list(type_code: u8, data: &[u8], width: usize) -> Result<Vec<Uuid>> {
        if data.len() % width != 0 {
            return Err(Error::InvalidData {
                context: format!(
                    "AD type {:#04x}: {} bytes is not a multiple of {}",
                    type_code,
                    data.len(),
                    width
                ),
            });
        }

        // All multi-byte AD values are little-endian
        let list = data
            .chunks_exact(width)
            .map(|chunk| match width {
                2 => uuids::from_u16(u16::from_le_bytes([chunk[0], chunk[1]])),
                4 => uuids::from_u32(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
                _ => {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(chunk);
                    bytes.reverse();
                    Uuid::from_bytes(bytes)
                }
            })
            .collect();
        Ok(list)
    }
}

/// Get the complete local name from a record set, if one was advertised.
pub fn local_name(records: &[AdvertisementRecord]) -> Option<&str> {
    records.iter().find_map(|r| match r {
        AdvertisementRecord::CompleteLocalName(name) => Some(name.as_str()),
        _ => None,
    })
}

/// Contents of one physical advertising packet as delivered by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketData {
    /// Undecoded AD structures.
    Raw(Bytes),
    /// Records already typed by the platform stack.
    Records(Vec<AdvertisementRecord>),
}

/// One advertising packet received during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisementPacket {
    /// The advertising device.
    pub identifier: DeviceIdentifier,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// The packet contents.
    pub data: PacketData,
}

/// How a packet relates to what the current scan window has already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// First packet from this device in the window.
    First,
    /// The device was seen before but advertised different records.
    Changed,
    /// Identical to the last snapshot for this device.
    Duplicate,
}

/// Per-scan-window advertisement ingest.
#[derive(Debug, Default)]
pub struct AdvertisementIngest {
    window: HashMap<DeviceIdentifier, Vec<AdvertisementRecord>>,
}

impl AdvertisementIngest {
    /// Create an empty ingest window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything seen so far; called when a new scan starts.
    pub fn reset(&mut self) {
        self.window.clear();
    }

    /// Number of distinct devices seen in this window.
    pub fn device_count(&self) -> usize {
        self.window.len()
    }

    /// Type a packet and classify it against the window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidData`] if a raw payload is malformed. The
    /// window is left unchanged in that case.
    pub fn ingest(
        &mut self,
        packet: &AdvertisementPacket,
    ) -> Result<(Sighting, Vec<AdvertisementRecord>)> {
        let records = match &packet.data {
            PacketData::Raw(payload) => AdvertisementRecord::parse_payload(payload)?,
            PacketData::Records(records) => records.clone(),
        };

        let sighting = match self.window.get(&packet.identifier) {
            None => Sighting::First,
            Some(previous) if *previous == records => Sighting::Duplicate,
            Some(_) => Sighting::Changed,
        };

        if sighting != Sighting::Duplicate {
            self.window.insert(packet.identifier, records.clone());
        }

        Ok((sighting, records))
    }
}
