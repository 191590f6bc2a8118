//! In-memory platform adapter.
//!
//! Simulates a radio and a set of peripherals so the scanner and the
//! connection manager can be driven without Bluetooth hardware.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::ble::adapter::{BleAdapter, LinkEvent, RadioState, ScanFilter, ScanMode};
use crate::ble::advertising::{AdvertisementPacket, AdvertisementRecord, PacketData};
use crate::ble::gatt::ServiceDescriptor;
use crate::ble::identifier::DeviceIdentifier;
use crate::error::{Error, Result};

/// How a simulated peer answers connection requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PeerBehavior {
    /// Accept connections after the configured latency.
    #[default]
    Responsive,
    /// Never answer; the connect hangs until the caller times out.
    Unresponsive,
    /// Refuse every connection.
    Reject(String),
}

/// A simulated peripheral.
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    /// The peer's identifier.
    pub identifier: DeviceIdentifier,
    /// What the peer advertises.
    pub advertisement: PacketData,
    /// Reported signal strength.
    pub rssi: Option<i16>,
    /// GATT database returned by discovery.
    pub services: Vec<ServiceDescriptor>,
    /// Connection behaviour.
    pub behavior: PeerBehavior,
    /// Time to establish a link.
    pub connect_latency: Duration,
    /// Time to complete service discovery.
    pub discovery_latency: Duration,
    /// Time to tear a link down.
    pub disconnect_latency: Duration,
}

impl SimulatedPeripheral {
    /// Create a responsive peer advertising only its name.
    pub fn new(identifier: DeviceIdentifier, name: &str) -> Self {
        Self {
            identifier,
            advertisement: PacketData::Records(vec![AdvertisementRecord::CompleteLocalName(
                name.to_string(),
            )]),
            rssi: Some(-60),
            services: Vec::new(),
            behavior: PeerBehavior::Responsive,
            connect_latency: Duration::from_millis(20),
            discovery_latency: Duration::from_millis(10),
            disconnect_latency: Duration::from_millis(10),
        }
    }

    /// Set the advertised payload.
    pub fn with_advertisement(mut self, advertisement: PacketData) -> Self {
        self.advertisement = advertisement;
        self
    }

    /// Set the GATT database.
    pub fn with_services(mut self, services: Vec<ServiceDescriptor>) -> Self {
        self.services = services;
        self
    }

    /// Set the connection behaviour.
    pub fn with_behavior(mut self, behavior: PeerBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Set the teardown latency.
    pub fn with_disconnect_latency(mut self, latency: Duration) -> Self {
        self.disconnect_latency = latency;
        self
    }

    /// Set the discovery latency.
    pub fn with_discovery_latency(mut self, latency: Duration) -> Self {
        self.discovery_latency = latency;
        self
    }

    fn packet(&self) -> AdvertisementPacket {
        AdvertisementPacket {
            identifier: self.identifier,
            rssi: self.rssi,
            data: self.advertisement.clone(),
        }
    }

    fn matches(&self, filter: &ScanFilter) -> bool {
        if filter.services.is_empty() {
            return true;
        }
        let records = match &self.advertisement {
            PacketData::Records(records) => records.clone(),
            PacketData::Raw(payload) => {
                AdvertisementRecord::parse_payload(payload).unwrap_or_default()
            }
        };
        records.iter().any(|r| match r {
            AdvertisementRecord::ServiceUuids(list) => {
                list.iter().any(|u| filter.services.contains(u))
            }
            _ => false,
        })
    }
}

struct PeerState {
    peer: SimulatedPeripheral,
    connected: bool,
    queries: usize,
}

/// Simulated radio with a fixed set of peers.
pub struct SimulatedAdapter {
    radio: RwLock<RadioState>,
    peers: RwLock<BTreeMap<DeviceIdentifier, PeerState>>,
    scan: Mutex<Option<(ScanFilter, mpsc::UnboundedSender<AdvertisementPacket>)>>,
    link_tx: broadcast::Sender<LinkEvent>,
}

impl SimulatedAdapter {
    /// Create a powered-on radio with no peers.
    pub fn new() -> Self {
        let (link_tx, _) = broadcast::channel(32);

        Self {
            radio: RwLock::new(RadioState::PoweredOn),
            peers: RwLock::new(BTreeMap::new()),
            scan: Mutex::new(None),
            link_tx,
        }
    }

    /// Add a peer, replacing any peer with the same identifier.
    pub fn add_peripheral(&self, peer: SimulatedPeripheral) {
        self.peers.write().insert(
            peer.identifier,
            PeerState {
                peer,
                connected: false,
                queries: 0,
            },
        );
    }

    /// Change the radio power state.
    pub fn set_radio_state(&self, state: RadioState) {
        *self.radio.write() = state;
    }

    /// Replace a peer's GATT database.
    pub fn set_services(&self, identifier: &DeviceIdentifier, services: Vec<ServiceDescriptor>) {
        if let Some(state) = self.peers.write().get_mut(identifier) {
            state.peer.services = services;
        }
    }

    /// Change how a peer answers connection requests.
    pub fn set_behavior(&self, identifier: &DeviceIdentifier, behavior: PeerBehavior) {
        if let Some(state) = self.peers.write().get_mut(identifier) {
            state.peer.behavior = behavior;
        }
    }

    /// Deliver one advertisement from a peer to the running scan.
    ///
    /// Returns `false` if no scan is running or the peer does not match its
    /// filter.
    pub fn advertise(&self, identifier: &DeviceIdentifier) -> bool {
        let peer = match self.peers.read().get(identifier) {
            Some(state) => state.peer.clone(),
            None => return false,
        };
        let scan = self.scan.lock();
        match scan.as_ref() {
            Some((filter, tx)) if peer.matches(filter) => tx.send(peer.packet()).is_ok(),
            _ => false,
        }
    }

    /// Deliver an arbitrary packet to the running scan.
    pub fn inject(&self, packet: AdvertisementPacket) -> bool {
        match self.scan.lock().as_ref() {
            Some((_, tx)) => tx.send(packet).is_ok(),
            None => false,
        }
    }

    /// Make a peer drop its link without being asked.
    pub fn drop_link(&self, identifier: &DeviceIdentifier) {
        let dropped = match self.peers.write().get_mut(identifier) {
            Some(state) if state.connected => {
                state.connected = false;
                true
            }
            _ => false,
        };
        if dropped {
            debug!("Simulated peer {} dropped the link", identifier);
            let _ = self.link_tx.send(LinkEvent::Disconnected(*identifier));
        }
    }

    /// Check whether a peer currently has a link.
    pub fn is_connected(&self, identifier: &DeviceIdentifier) -> bool {
        self.peers
            .read()
            .get(identifier)
            .map(|s| s.connected)
            .unwrap_or(false)
    }

    /// Number of discovery queries a peer has answered.
    pub fn query_count(&self, identifier: &DeviceIdentifier) -> usize {
        self.peers
            .read()
            .get(identifier)
            .map(|s| s.queries)
            .unwrap_or(0)
    }

    /// Check whether a platform scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scan.lock().is_some()
    }

    fn peer(&self, identifier: &DeviceIdentifier) -> Result<SimulatedPeripheral> {
        self.peers
            .read()
            .get(identifier)
            .map(|s| s.peer.clone())
            .ok_or_else(|| Error::NotFound {
                identifier: identifier.to_string(),
            })
    }

    fn require_radio(&self) -> Result<()> {
        if self.radio.read().is_on() {
            Ok(())
        } else {
            Err(Error::RadioUnavailable)
        }
    }
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleAdapter for SimulatedAdapter {
    async fn radio_state(&self) -> Result<RadioState> {
        Ok(*self.radio.read())
    }

    async fn start_scan(
        &self,
        mode: ScanMode,
        filter: ScanFilter,
    ) -> Result<BoxStream<'static, AdvertisementPacket>> {
        self.require_radio()?;
        trace!("Simulated scan started ({:?})", mode);

        let (tx, rx) = mpsc::unbounded_channel();
        for state in self.peers.read().values() {
            if state.peer.matches(&filter) {
                let _ = tx.send(state.peer.packet());
            }
        }
        *self.scan.lock() = Some((filter, tx));

        let packets = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|packet| (packet, rx))
        });
        Ok(packets.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        // Dropping the sender ends the packet stream
        self.scan.lock().take();
        Ok(())
    }

    async fn connect(&self, identifier: &DeviceIdentifier, _timeout: Duration) -> Result<()> {
        self.require_radio()?;
        let peer = self.peer(identifier)?;

        match peer.behavior {
            PeerBehavior::Responsive => {}
            PeerBehavior::Unresponsive => futures::future::pending::<()>().await,
            PeerBehavior::Reject(reason) => return Err(Error::ConnectFailed { reason }),
        }

        tokio::time::sleep(peer.connect_latency).await;
        if let Some(state) = self.peers.write().get_mut(identifier) {
            state.connected = true;
        }
        Ok(())
    }

    async fn query_services(
        &self,
        identifier: &DeviceIdentifier,
    ) -> Result<Vec<ServiceDescriptor>> {
        let peer = self.peer(identifier)?;
        if !self.is_connected(identifier) {
            return Err(Error::LinkLost);
        }

        tokio::time::sleep(peer.discovery_latency).await;

        let mut peers = self.peers.write();
        match peers.get_mut(identifier) {
            Some(state) if state.connected => {
                state.queries += 1;
                Ok(state.peer.services.clone())
            }
            _ => Err(Error::LinkLost),
        }
    }

    async fn disconnect(&self, identifier: &DeviceIdentifier) -> Result<()> {
        let peer = self.peer(identifier)?;
        tokio::time::sleep(peer.disconnect_latency).await;
        if let Some(state) = self.peers.write().get_mut(identifier) {
            state.connected = false;
        }
        Ok(())
    }

    async fn link_events(&self) -> Result<BoxStream<'static, LinkEvent>> {
        let rx = self.link_tx.subscribe();
        let events = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(events.boxed())
    }
}
