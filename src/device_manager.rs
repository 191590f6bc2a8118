//! Device manager: the caller-facing central.
//!
//! Ties one adapter handle to a registry, a scanner and a connection manager,
//! and watches the adapter for unsolicited link loss. The manager never
//! prints; observe it through `tracing` or [`DeviceManager::subscribe`].

use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::ble::adapter::{BleAdapter, LinkEvent, ScanMode};
use crate::ble::connection::{ConnectionConfig, ConnectionEvent, ConnectionManager};
use crate::ble::gatt::ServiceDescriptor;
use crate::ble::identifier::DeviceIdentifier;
use crate::ble::platform::BtleplugAdapter;
use crate::ble::scanner::{ScanConfig, ScanEvents, Scanner};
use crate::error::{Error, Result};
use crate::registry::{DeviceEntry, DeviceRegistry, NameMatch};

/// Configuration for a [`DeviceManager`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceManagerConfig {
    /// Base scan parameters; `scan()` overrides mode and duration.
    pub scan: ScanConfig,
    /// Connection timeouts.
    pub connection: ConnectionConfig,
    /// Name matching policy for [`DeviceManager::connect_by_name`].
    pub name_match: NameMatch,
}

/// Central manager for discovering and connecting to BLE devices.
pub struct DeviceManager {
    /// Shared device registry.
    registry: Arc<DeviceRegistry>,
    /// Scan session.
    scanner: Scanner,
    /// Connection sessions.
    connections: Arc<ConnectionManager>,
    /// Configuration.
    config: DeviceManagerConfig,
    /// Link-loss watcher task.
    link_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DeviceManager {
    /// Create a manager over the system's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RadioUnavailable`] if there is no Bluetooth hardware.
    pub async fn with_platform() -> Result<Self> {
        let adapter = BtleplugAdapter::new().await?;
        Self::new(Arc::new(adapter)).await
    }

    /// Create a manager over an adapter with default configuration.
    pub async fn new(adapter: Arc<dyn BleAdapter>) -> Result<Self> {
        Self::with_config(adapter, DeviceManagerConfig::default()).await
    }

    /// Create a manager over an adapter.
    pub async fn with_config(
        adapter: Arc<dyn BleAdapter>,
        config: DeviceManagerConfig,
    ) -> Result<Self> {
        let registry = Arc::new(DeviceRegistry::new());
        let scanner = Scanner::new(adapter.clone(), registry.clone());
        let connections = Arc::new(ConnectionManager::with_config(
            adapter.clone(),
            registry.clone(),
            config.connection.clone(),
        ));

        let mut link_events = adapter.link_events().await?;
        let watcher = connections.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = link_events.next().await {
                match event {
                    LinkEvent::Disconnected(identifier) => {
                        watcher.handle_link_lost(&identifier);
                    }
                }
            }
            debug!("Link event stream ended");
        });

        Ok(Self {
            registry,
            scanner,
            connections,
            config,
            link_handle: Mutex::new(Some(handle)),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &DeviceManagerConfig {
        &self.config
    }

    /// Get the device registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Get the connection manager.
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Scan for `duration_ms` milliseconds and return what was found.
    ///
    /// # Errors
    ///
    /// [`Error::RadioUnavailable`] if the radio is off and
    /// [`Error::ScanAlreadyActive`] if a scan is running.
    pub async fn scan(&self, mode: ScanMode, duration_ms: u64) -> Result<Vec<DeviceEntry>> {
        let config = self
            .config
            .scan
            .clone()
            .with_mode(mode)
            .with_duration(Duration::from_millis(duration_ms));

        let events = self.scanner.start(config).await?;
        let reported = events.count().await;

        let devices = self.registry.entries();
        info!(
            "Scan finished: {} events, {} devices",
            reported,
            devices.len()
        );
        Ok(devices)
    }

    /// Start a scan and stream its discovery events.
    pub async fn start_scan(&self, config: ScanConfig) -> Result<ScanEvents> {
        self.scanner.start(config).await
    }

    /// Stop the running scan.
    pub async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop().await
    }

    /// Check if scanning is active.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Connect to a device by identifier, with no prior scan needed.
    pub async fn connect_known(&self, identifier: &DeviceIdentifier) -> Result<DeviceEntry> {
        self.connections.connect(identifier).await?;
        self.registry.get(identifier)
    }

    /// Connect to a device by its textual address or UUID.
    pub async fn connect_known_address(&self, address: &str) -> Result<DeviceEntry> {
        let identifier: DeviceIdentifier = address.parse()?;
        self.connect_known(&identifier).await
    }

    /// Connect to the first scanned device whose name matches.
    ///
    /// # Errors
    ///
    /// [`Error::ScanRequired`] if no scan has finished yet and
    /// [`Error::NotFound`] if no device name matches.
    pub async fn connect_by_name(&self, name: &str) -> Result<DeviceEntry> {
        if !self.scanner.has_scanned() {
            return Err(Error::ScanRequired);
        }

        let entry = self
            .registry
            .find_by_name(name, self.config.name_match)
            .ok_or_else(|| Error::NotFound {
                identifier: name.to_string(),
            })?;

        self.connect_known(&entry.identifier).await
    }

    /// Run service discovery on a connected device.
    pub async fn discover_services(
        &self,
        identifier: &DeviceIdentifier,
    ) -> Result<Vec<ServiceDescriptor>> {
        self.connections.discover_services(identifier).await
    }

    /// Get the services discovered on the device's current connection.
    pub async fn list_services(
        &self,
        identifier: &DeviceIdentifier,
    ) -> Result<Vec<ServiceDescriptor>> {
        self.connections.services(identifier)
    }

    /// Disconnect from a device.
    pub async fn disconnect(&self, identifier: &DeviceIdentifier) -> Result<()> {
        self.connections.disconnect(identifier).await
    }

    /// Get all known devices.
    pub fn devices(&self) -> Vec<DeviceEntry> {
        self.registry.entries()
    }

    /// Get the devices currently connected through this manager.
    pub fn connected_devices(&self) -> Vec<DeviceEntry> {
        self.registry.connected()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connections.subscribe()
    }

    /// Clean shutdown of all connections and scanning.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        self.scanner.stop().await?;

        for entry in self.registry.entries() {
            if entry.connection_state.is_connected() || entry.connection_state.is_transitioning() {
                if let Err(e) = self.connections.disconnect(&entry.identifier).await {
                    warn!("Error disconnecting {}: {}", entry.identifier, e);
                }
            }
        }

        if let Some(handle) = self.link_handle.lock().take() {
            handle.abort();
        }

        Ok(())
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if let Some(handle) = self.link_handle.lock().take() {
            handle.abort();
        }
    }
}
