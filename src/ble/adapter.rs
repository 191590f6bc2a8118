//! The platform Bluetooth seam.
//!
//! Everything below this trait (radio access, GATT transactions, link
//! management) belongs to the operating system stack. The scanner and the
//! connection manager only ever talk to a [`BleAdapter`] handle passed in by
//! the caller.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use uuid::Uuid;

use crate::ble::advertising::AdvertisementPacket;
use crate::ble::gatt::ServiceDescriptor;
use crate::ble::identifier::DeviceIdentifier;
use crate::error::Result;

/// Power state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioState {
    /// The platform could not report a state.
    #[default]
    Unknown,
    /// The radio is on.
    PoweredOn,
    /// The radio is off.
    PoweredOff,
}

impl RadioState {
    /// Check if the radio can be used.
    pub fn is_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl std::fmt::Display for RadioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::PoweredOn => write!(f, "PoweredOn"),
            Self::PoweredOff => write!(f, "PoweredOff"),
        }
    }
}

/// Scan duty cycle requested from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanMode {
    /// Listen only, never send scan requests.
    Passive,
    /// Active scanning with a low duty cycle.
    #[default]
    LowPower,
    /// Active scanning balancing latency and power.
    Balanced,
    /// Active scanning at the highest duty cycle.
    LowLatency,
}

impl ScanMode {
    /// Check if the mode sends scan requests.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Passive)
    }
}

/// Platform-level scan filter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanFilter {
    /// Only report devices advertising one of these services. Empty means
    /// report everything.
    pub services: Vec<Uuid>,
}

/// Link-level notifications from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The peer or the platform dropped the link without being asked to.
    Disconnected(DeviceIdentifier),
}

/// Opaque platform Bluetooth collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Report the radio power state.
    async fn radio_state(&self) -> Result<RadioState>;

    /// Start scanning and return the packet stream.
    ///
    /// The stream ends once [`BleAdapter::stop_scan`] has been called.
    async fn start_scan(
        &self,
        mode: ScanMode,
        filter: ScanFilter,
    ) -> Result<BoxStream<'static, AdvertisementPacket>>;

    /// Stop the current scan.
    async fn stop_scan(&self) -> Result<()>;

    /// Establish a link to a device.
    async fn connect(&self, identifier: &DeviceIdentifier, timeout: Duration) -> Result<()>;

    /// Run GATT discovery on an established link.
    async fn query_services(&self, identifier: &DeviceIdentifier) -> Result<Vec<ServiceDescriptor>>;

    /// Tear a link down.
    async fn disconnect(&self, identifier: &DeviceIdentifier) -> Result<()>;

    /// Stream of unsolicited link events.
    async fn link_events(&self) -> Result<BoxStream<'static, LinkEvent>>;
}
