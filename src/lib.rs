//! # ble-session
//!
//! A Bluetooth Low Energy central-role session manager: scanning, a device
//! registry, and per-device connection and GATT discovery sessions on top of
//! an explicitly passed platform adapter.
//!
//! Discovered services belong to the connection that discovered them. They
//! are discarded the moment a disconnect starts, so a reconnect never sees a
//! stale service cache and must run discovery again.
//!
//! ## Features
//!
//! - **Scanning**: deadline-bounded scans streamed as [`DiscoveryEvent`]s
//! - **Advertisement Ingest**: raw AD structures typed into records,
//!   deduplicated per device within a scan
//! - **Device Registry**: last advertisement and connection state per device
//! - **Connection Sessions**: connect, discover, disconnect and link loss
//!   with a strict state machine and caller timeouts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_session::{DeviceManager, Result, ScanMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = DeviceManager::with_platform().await?;
//!
//!     for device in manager.scan(ScanMode::LowPower, 2000).await? {
//!         println!("{} {:?}", device.identifier, device.display_name);
//!     }
//!
//!     let device = manager.connect_by_name("Thingy").await?;
//!     let services = manager.discover_services(&device.identifier).await?;
//!     println!("Found {} services", services.len());
//!
//!     manager.disconnect(&device.identifier).await?;
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Device addresses are hidden; devices are
//! identified by platform UUIDs instead.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data and config types

// Public modules
pub mod ble;
pub mod device_manager;
pub mod error;
pub mod registry;

// Re-exports for convenience
pub use device_manager::{DeviceManager, DeviceManagerConfig};
pub use error::{Error, Result};
pub use registry::{DeviceEntry, DeviceRegistry, NameMatch};

// Re-export commonly used types from submodules
pub use ble::{
    AdvertisementRecord, BleAdapter, BtleplugAdapter, CharacteristicDescriptor,
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState, DeviceIdentifier,
    DiscoveryEvent, RadioState, ScanConfig, ScanEvents, ScanMode, Scanner, ServiceDescriptor,
    SimulatedAdapter, SimulatedPeripheral,
};
