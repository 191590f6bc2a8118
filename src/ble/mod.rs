//! BLE communication module.
//!
//! This module provides the central-role building blocks: the platform
//! adapter seam, advertisement ingest, scanning and connection sessions.

pub mod adapter;
pub mod advertising;
pub mod connection;
pub mod gatt;
pub mod identifier;
pub mod platform;
pub mod scanner;
pub mod simulated;
pub mod uuids;

pub use adapter::{BleAdapter, LinkEvent, RadioState, ScanFilter, ScanMode};
pub use advertising::{
    AdvertisementIngest, AdvertisementPacket, AdvertisementRecord, PacketData, Sighting,
};
pub use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState};
pub use gatt::{CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor};
pub use identifier::DeviceIdentifier;
pub use platform::BtleplugAdapter;
pub use scanner::{DiscoveryEvent, ScanConfig, ScanEvents, Scanner};
pub use simulated::{PeerBehavior, SimulatedAdapter, SimulatedPeripheral};
