//! `btleplug` implementation of the platform seam.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter as PlatformScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::ble::adapter::{BleAdapter, LinkEvent, RadioState, ScanFilter, ScanMode};
use crate::ble::advertising::{AdvertisementPacket, AdvertisementRecord, PacketData};
use crate::ble::gatt::ServiceDescriptor;
use crate::ble::identifier::DeviceIdentifier;
use crate::ble::uuids;
use crate::error::{Error, Result};

/// AD type: TX power level.
const AD_TYPE_TX_POWER: u8 = 0x0a;
/// AD type: service data with a 16-bit UUID.
const AD_TYPE_SERVICE_DATA_UUID16: u8 = 0x16;
/// AD type: service data with a 128-bit UUID.
const AD_TYPE_SERVICE_DATA_UUID128: u8 = 0x21;

type PeripheralCache = Arc<RwLock<HashMap<DeviceIdentifier, Peripheral>>>;

/// Platform adapter backed by the operating system Bluetooth stack.
pub struct BtleplugAdapter {
    /// The BLE adapter.
    adapter: Adapter,
    /// Peripherals seen so far, by identifier.
    peripherals: PeripheralCache,
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter on the system.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RadioUnavailable`] if there is no Bluetooth hardware.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::RadioUnavailable)?;

        let adapters = manager.adapters().await?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::RadioUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Wrap a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Find the peripheral for an identifier, asking the platform if it has
    /// not been seen in a scan.
    async fn peripheral(&self, identifier: &DeviceIdentifier) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.read().get(identifier) {
            return Ok(peripheral.clone());
        }

        for peripheral in self.adapter.peripherals().await? {
            if let Some(id) = identifier_for(&peripheral) {
                self.peripherals.write().insert(id, peripheral.clone());
                if id == *identifier {
                    return Ok(peripheral);
                }
            }
        }

        Err(Error::NotFound {
            identifier: identifier.to_string(),
        })
    }

    async fn packet_for(
        adapter: &Adapter,
        cache: &PeripheralCache,
        id: &PeripheralId,
    ) -> Option<AdvertisementPacket> {
        let peripheral = match adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let identifier = identifier_for(&peripheral)?;
        cache.write().insert(identifier, peripheral);

        Some(AdvertisementPacket {
            identifier,
            rssi: properties.rssi,
            data: PacketData::Records(records_from_properties(&properties)),
        })
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn radio_state(&self) -> Result<RadioState> {
        let state = match self.adapter.adapter_state().await? {
            CentralState::PoweredOn => RadioState::PoweredOn,
            CentralState::PoweredOff => RadioState::PoweredOff,
            _ => RadioState::Unknown,
        };
        Ok(state)
    }

    async fn start_scan(
        &self,
        mode: ScanMode,
        filter: ScanFilter,
    ) -> Result<BoxStream<'static, AdvertisementPacket>> {
        // btleplug leaves duty cycle to the platform
        debug!("Starting platform scan ({:?} requested)", mode);

        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(PlatformScanFilter {
                services: filter.services,
            })
            .await?;

        let adapter = self.adapter.clone();
        let cache = self.peripherals.clone();

        let packets = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let cache = cache.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServiceDataAdvertisement { id, .. }
                    | CentralEvent::ServicesAdvertisement { id, .. } => {
                        Self::packet_for(&adapter, &cache, &id).await
                    }
                    _ => None,
                }
            }
        });

        Ok(packets.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, identifier: &DeviceIdentifier, timeout: Duration) -> Result<()> {
        let peripheral = self.peripheral(identifier).await?;

        match tokio::time::timeout(timeout, peripheral.connect()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn query_services(
        &self,
        identifier: &DeviceIdentifier,
    ) -> Result<Vec<ServiceDescriptor>> {
        let peripheral = self.peripheral(identifier).await?;

        if !peripheral.is_connected().await? {
            return Err(Error::LinkLost);
        }

        peripheral.discover_services().await?;
        Ok(peripheral
            .services()
            .iter()
            .map(ServiceDescriptor::from)
            .collect())
    }

    async fn disconnect(&self, identifier: &DeviceIdentifier) -> Result<()> {
        let peripheral = self.peripheral(identifier).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn link_events(&self) -> Result<BoxStream<'static, LinkEvent>> {
        let events = self.adapter.events().await?;
        let adapter = self.adapter.clone();

        let links = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDisconnected(id) => {
                        let peripheral = adapter.peripheral(&id).await.ok()?;
                        identifier_for(&peripheral).map(LinkEvent::Disconnected)
                    }
                    _ => None,
                }
            }
        });

        Ok(links.boxed())
    }
}

/// Derive the identifier of a platform peripheral.
///
/// Platforms that hide the device address (macOS) expose a UUID instead.
fn identifier_for(peripheral: &Peripheral) -> Option<DeviceIdentifier> {
    let address = peripheral.address();
    if address.into_inner() != [0u8; 6] {
        return Some(address.into());
    }
    Uuid::parse_str(&peripheral.id().to_string())
        .ok()
        .map(DeviceIdentifier::Uuid)
}

/// Re-type the platform's parsed advertisement as records.
pub fn records_from_properties(properties: &PeripheralProperties) -> Vec<AdvertisementRecord> {
    let mut records = Vec::new();

    if let Some(name) = &properties.local_name {
        records.push(AdvertisementRecord::CompleteLocalName(name.clone()));
    }

    if !properties.services.is_empty() {
        records.push(AdvertisementRecord::ServiceUuids(properties.services.clone()));
    }

    let mut manufacturers: Vec<_> = properties.manufacturer_data.iter().collect();
    manufacturers.sort_by_key(|(company_id, _)| **company_id);
    for (company_id, data) in manufacturers {
        records.push(AdvertisementRecord::ManufacturerData {
            company_id: *company_id,
            data: Bytes::copy_from_slice(data),
        });
    }

    let mut service_data: Vec<_> = properties.service_data.iter().collect();
    service_data.sort_by_key(|(uuid, _)| **uuid);
    for (uuid, data) in service_data {
        let mut field = BytesMut::with_capacity(16 + data.len());
        let type_code = match uuids::to_u16(uuid) {
            Some(short) => {
                field.put_u16_le(short);
                AD_TYPE_SERVICE_DATA_UUID16
            }
            None => {
                let mut le = *uuid.as_bytes();
                le.reverse();
                field.put_slice(&le);
                AD_TYPE_SERVICE_DATA_UUID128
            }
        };
        field.put_slice(data);
        records.push(AdvertisementRecord::Unknown {
            type_code,
            data: field.freeze(),
        });
    }

    if let Some(tx_power) = properties.tx_power_level {
        records.push(AdvertisementRecord::Unknown {
            type_code: AD_TYPE_TX_POWER,
            data: Bytes::copy_from_slice(&[tx_power as i8 as u8]),
        });
    }

    records
}
