//! Device registry.
//!
//! The registry is the single shared record of every device the central has
//! seen or been asked to address. Scanning writes advertisement snapshots;
//! only the connection manager writes connection state.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::ble::advertising::{self, AdvertisementRecord};
use crate::ble::connection::ConnectionState;
use crate::ble::identifier::DeviceIdentifier;
use crate::error::{Error, Result};

/// How a name lookup matches against advertised names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NameMatch {
    /// The whole name must match.
    Exact,
    /// The name must start with the query.
    Prefix,
    /// The name must contain the query.
    #[default]
    Contains,
}

impl NameMatch {
    /// Check a candidate name against a query.
    pub fn matches(&self, name: &str, query: &str) -> bool {
        match self {
            Self::Exact => name == query,
            Self::Prefix => name.starts_with(query),
            Self::Contains => name.contains(query),
        }
    }
}

/// Registry record for one device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceEntry {
    /// The device identifier.
    pub identifier: DeviceIdentifier,
    /// Name from the most recent advertisement carrying one.
    pub display_name: Option<String>,
    /// Records of the most recent packet in the current scan.
    pub last_advertisement: Vec<AdvertisementRecord>,
    /// Current connection state.
    pub connection_state: ConnectionState,
    /// Signal strength of the most recent packet in dBm.
    pub rssi: Option<i16>,
    /// When the most recent packet arrived.
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceEntry {
    fn new(identifier: DeviceIdentifier) -> Self {
        Self {
            identifier,
            display_name: None,
            last_advertisement: Vec::new(),
            connection_state: ConnectionState::Disconnected,
            rssi: None,
            last_seen: None,
        }
    }

    fn drop_advertisement(&mut self) {
        self.last_advertisement.clear();
        self.rssi = None;
        self.last_seen = None;
    }
}

/// Thread-safe device registry.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: RwLock<HashMap<DeviceIdentifier, DeviceEntry>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the advertisement snapshot for a device.
    ///
    /// Connection state is preserved. The display name is replaced only when
    /// the new records carry a complete local name.
    pub fn upsert(
        &self,
        identifier: DeviceIdentifier,
        records: Vec<AdvertisementRecord>,
        rssi: Option<i16>,
    ) {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(identifier)
            .or_insert_with(|| DeviceEntry::new(identifier));

        if let Some(name) = advertising::local_name(&records) {
            entry.display_name = Some(name.to_string());
        }
        entry.last_advertisement = records;
        entry.rssi = rssi;
        entry.last_seen = Some(Utc::now());

        trace!("Registry upsert: {}", identifier);
    }

    /// Make sure an entry exists for a known address without touching it.
    pub fn ensure(&self, identifier: DeviceIdentifier) {
        self.entries
            .write()
            .entry(identifier)
            .or_insert_with(|| DeviceEntry::new(identifier));
    }

    /// Get a snapshot of a device entry.
    pub fn get(&self, identifier: &DeviceIdentifier) -> Result<DeviceEntry> {
        self.entries
            .read()
            .get(identifier)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                identifier: identifier.to_string(),
            })
    }

    /// Get the connection state of a device.
    pub fn state(&self, identifier: &DeviceIdentifier) -> Result<ConnectionState> {
        self.entries
            .read()
            .get(identifier)
            .map(|e| e.connection_state)
            .ok_or_else(|| Error::NotFound {
                identifier: identifier.to_string(),
            })
    }

    /// Remove every disconnected device.
    ///
    /// Devices with a live or transitioning session keep their entry and
    /// state but lose their advertisement history.
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.retain(|_, entry| entry.connection_state != ConnectionState::Disconnected);
        for entry in entries.values_mut() {
            entry.drop_advertisement();
        }
        debug!("Registry cleared, {} connected entries kept", entries.len());
    }

    /// Apply a connection state transition.
    ///
    /// Returns the previous state.
    pub(crate) fn set_state(
        &self,
        identifier: &DeviceIdentifier,
        new_state: ConnectionState,
    ) -> Result<ConnectionState> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(identifier).ok_or_else(|| Error::NotFound {
            identifier: identifier.to_string(),
        })?;

        let old_state = entry.connection_state;
        if !old_state.can_transition_to(new_state) {
            return Err(Error::InvalidStateTransition {
                from: old_state,
                to: new_state,
            });
        }

        entry.connection_state = new_state;
        Ok(old_state)
    }

    /// Get snapshots of all entries, ordered by identifier.
    pub fn entries(&self) -> Vec<DeviceEntry> {
        let mut list: Vec<_> = self.entries.read().values().cloned().collect();
        list.sort_by_key(|e| e.identifier);
        list
    }

    /// Get every device currently in the connected state.
    pub fn connected(&self) -> Vec<DeviceEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.connection_state.is_connected())
            .collect()
    }

    /// Find the first device whose display name matches.
    ///
    /// Candidates are checked in identifier order so the result is stable.
    pub fn find_by_name(&self, query: &str, policy: NameMatch) -> Option<DeviceEntry> {
        self.entries().into_iter().find(|e| {
            e.display_name
                .as_deref()
                .map(|name| policy.matches(name, query))
                .unwrap_or(false)
        })
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
