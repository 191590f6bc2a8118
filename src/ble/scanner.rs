//! BLE scanning functionality.
//!
//! A scan runs as a background task bounded by a deadline. Every packet is
//! typed by the advertisement ingest, upserted into the registry and handed
//! to the caller through a [`ScanEvents`] stream.

use futures::stream::{Stream, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::adapter::{BleAdapter, ScanFilter, ScanMode};
use crate::ble::advertising::{
    AdvertisementIngest, AdvertisementPacket, AdvertisementRecord, Sighting,
};
use crate::ble::identifier::DeviceIdentifier;
use crate::error::{Error, Result};
use crate::registry::DeviceRegistry;

/// Scan parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanConfig {
    /// Platform scan mode.
    pub mode: ScanMode,
    /// How long the scan runs before its deadline fires.
    pub duration: Duration,
    /// Only report devices advertising one of these services.
    pub service_filter: Vec<Uuid>,
    /// Also emit packets identical to the device's last snapshot.
    pub report_duplicates: bool,
}

impl ScanConfig {
    /// Default scan duration (2 seconds).
    pub const DEFAULT_DURATION: Duration = Duration::from_millis(2000);

    /// Set the scan mode.
    pub fn with_mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the scan duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Only report devices advertising `service`.
    pub fn filter_by_service(mut self, service: Uuid) -> Self {
        self.service_filter.push(service);
        self
    }

    /// Also emit packets that repeat the device's last snapshot.
    pub fn report_duplicates(mut self, report: bool) -> Self {
        self.report_duplicates = report;
        self
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mode: ScanMode::default(),
            duration: Self::DEFAULT_DURATION,
            service_filter: Vec::new(),
            report_duplicates: false,
        }
    }
}

/// Event emitted for each advertising packet worth reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryEvent {
    /// The advertising device.
    pub identifier: DeviceIdentifier,
    /// Typed records of the packet.
    pub records: Vec<AdvertisementRecord>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Whether this is the device's first packet in the scan.
    pub sighting: Sighting,
}

/// Stream of discovery events for one scan.
///
/// Ends after the scan's deadline or [`Scanner::stop`], once every event
/// queued before that point has been yielded.
pub struct ScanEvents {
    rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
}

impl Stream for ScanEvents {
    type Item = DiscoveryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Releases the scanning flag unless the scan task took it over.
struct ScanClaim<'a>(Option<&'a AtomicBool>);

impl ScanClaim<'_> {
    fn keep(mut self) {
        self.0 = None;
    }
}

impl Drop for ScanClaim<'_> {
    fn drop(&mut self) {
        if let Some(flag) = self.0 {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Scan session for one adapter.
pub struct Scanner {
    /// The BLE adapter to scan with.
    adapter: Arc<dyn BleAdapter>,
    /// Registry fed by the scan.
    registry: Arc<DeviceRegistry>,
    /// Whether scanning is currently active.
    is_scanning: Arc<AtomicBool>,
    /// Whether any scan has run to completion.
    has_scanned: Arc<AtomicBool>,
    /// Deduplication window of the current scan.
    ingest: Arc<Mutex<AdvertisementIngest>>,
    /// Stops the running scan early.
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Handle to the scanning task.
    scan_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scanner {
    /// Create a scanner over an adapter and registry.
    pub fn new(adapter: Arc<dyn BleAdapter>, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            adapter,
            registry,
            is_scanning: Arc::new(AtomicBool::new(false)),
            has_scanned: Arc::new(AtomicBool::new(false)),
            ingest: Arc::new(Mutex::new(AdvertisementIngest::new())),
            stop_tx: Mutex::new(None),
            scan_handle: Mutex::new(None),
        }
    }

    /// Start a scan.
    ///
    /// Clears the registry of disconnected devices and arms the deadline.
    ///
    /// # Errors
    ///
    /// [`Error::ScanAlreadyActive`] if a scan is running and
    /// [`Error::RadioUnavailable`] if the radio is not powered on.
    pub async fn start(&self, config: ScanConfig) -> Result<ScanEvents> {
        if self
            .is_scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::ScanAlreadyActive);
        }

        let claim = ScanClaim(Some(&*self.is_scanning));
        let events = self.begin(config).await?;
        claim.keep();
        Ok(events)
    }

    async fn begin(&self, config: ScanConfig) -> Result<ScanEvents> {
        let radio = self.adapter.radio_state().await?;
        if !radio.is_on() {
            warn!("Bluetooth radio is {}", radio);
            return Err(Error::RadioUnavailable);
        }

        info!(
            "Starting {:?} scan for {} ms",
            config.mode,
            config.duration.as_millis()
        );

        self.registry.clear();
        self.ingest.lock().reset();

        let filter = ScanFilter {
            services: config.service_filter.clone(),
        };
        let mut packets = self.adapter.start_scan(config.mode, filter).await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        let ingest = self.ingest.clone();
        let is_scanning = self.is_scanning.clone();
        let has_scanned = self.has_scanned.clone();
        let report_duplicates = config.report_duplicates;
        let deadline = tokio::time::sleep(config.duration);

        let handle = tokio::spawn(async move {
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut deadline => {
                        debug!("Scan deadline reached");
                        break;
                    }
                    _ = &mut stop_rx => {
                        debug!("Scan stopped");
                        break;
                    }
                    packet = packets.next() => match packet {
                        Some(packet) => {
                            if let Some(event) = Self::handle_packet(
                                packet,
                                &ingest,
                                &registry,
                                report_duplicates,
                            ) {
                                let _ = event_tx.send(event);
                            }
                        }
                        None => {
                            debug!("Adapter ended the scan stream");
                            break;
                        }
                    },
                }
            }

            // Deliver packets the platform queued before the scan ended
            while let Some(Some(packet)) = packets.next().now_or_never() {
                if let Some(event) =
                    Self::handle_packet(packet, &ingest, &registry, report_duplicates)
                {
                    let _ = event_tx.send(event);
                }
            }

            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop platform scan: {}", e);
            }

            has_scanned.store(true, Ordering::SeqCst);
            is_scanning.store(false, Ordering::SeqCst);
            debug!("Scan event loop ended");
        });

        *self.stop_tx.lock() = Some(stop_tx);
        *self.scan_handle.lock() = Some(handle);

        Ok(ScanEvents { rx: event_rx })
    }

    /// Stop the running scan and wait for it to wind down.
    pub async fn stop(&self) -> Result<()> {
        if !self.is_scanning() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(());
        }

        let handle = self.scan_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Scan task ended abnormally: {}", e);
                self.is_scanning.store(false, Ordering::SeqCst);
            }
        }

        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.is_scanning.load(Ordering::SeqCst)
    }

    /// Check whether at least one scan has finished.
    pub fn has_scanned(&self) -> bool {
        self.has_scanned.load(Ordering::SeqCst)
    }

    /// Type one packet, update the registry and decide whether to report it.
    fn handle_packet(
        packet: AdvertisementPacket,
        ingest: &Mutex<AdvertisementIngest>,
        registry: &DeviceRegistry,
        report_duplicates: bool,
    ) -> Option<DiscoveryEvent> {
        let outcome = ingest.lock().ingest(&packet);
        let (sighting, records) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                trace!("Dropping advertisement from {}: {}", packet.identifier, e);
                return None;
            }
        };

        registry.upsert(packet.identifier, records.clone(), packet.rssi);

        if sighting == Sighting::Duplicate && !report_duplicates {
            return None;
        }

        if sighting == Sighting::First {
            debug!("Discovered device {}", packet.identifier);
        }

        Some(DiscoveryEvent {
            identifier: packet.identifier,
            records,
            rssi: packet.rssi,
            sighting,
        })
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(());
        }
    }
}
