//! BLE connection management.
//!
//! Owns the lifecycle of each device session: connect, service discovery,
//! disconnect and link loss. One session exists per device identifier, and
//! every state change for an identifier happens under that identifier's
//! session lock.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::ble::adapter::BleAdapter;
use crate::ble::gatt::ServiceDescriptor;
use crate::ble::identifier::DeviceIdentifier;
use crate::error::{Error, Result};
use crate::registry::DeviceRegistry;

/// Connection state for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the device.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the device.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }

    /// Check whether `next` follows this state in the transition table.
    ///
    /// The cycle is `Disconnected -> Connecting -> Connected -> Disconnecting
    /// -> Disconnected`. A connect in progress may also roll back to
    /// `Disconnected` or be cut short into `Disconnecting`.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The device whose state changed.
    pub identifier: DeviceIdentifier,
    /// The new connection state.
    pub state: ConnectionState,
}

/// Timeouts applied when the caller does not pass one.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionConfig {
    /// Upper bound for establishing a link.
    pub connect_timeout: Duration,
    /// Upper bound for tearing a link down.
    pub disconnect_timeout: Duration,
}

impl ConnectionConfig {
    /// Default connect timeout (10 seconds).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default disconnect timeout (5 seconds).
    pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the disconnect timeout.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            disconnect_timeout: Self::DEFAULT_DISCONNECT_TIMEOUT,
        }
    }
}

/// Per-identifier session slot.
#[derive(Default)]
struct Session {
    /// Bumped every time a session starts or ends.
    generation: u64,
    /// Services found on the current session.
    services: Option<Vec<ServiceDescriptor>>,
    /// Wakes an in-flight connect that has been overtaken.
    cancel_connect: Option<oneshot::Sender<&'static str>>,
    /// Generation of the session with a discovery in flight.
    discovering: Option<u64>,
    /// Whether the last session ended because the peer dropped the link.
    ended_by_link_loss: bool,
}

/// Operation whose unwinding an [`Unwind`] guard performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Connect,
    Discover,
    Disconnect,
}

/// Restores a session slot if an operation's future is dropped mid-flight.
///
/// Armed once the operation has changed the slot, disarmed when the
/// operation reaches its own completion code.
struct Unwind<'a> {
    manager: &'a ConnectionManager,
    identifier: DeviceIdentifier,
    slot: Arc<Mutex<Session>>,
    generation: u64,
    pending: Pending,
    armed: bool,
}

impl<'a> Unwind<'a> {
    fn new(
        manager: &'a ConnectionManager,
        identifier: DeviceIdentifier,
        slot: Arc<Mutex<Session>>,
        generation: u64,
        pending: Pending,
    ) -> Self {
        Self {
            manager,
            identifier,
            slot,
            generation,
            pending,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Unwind<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut session = self.slot.lock();
        if self.pending == Pending::Discover {
            if session.discovering == Some(self.generation) {
                session.discovering = None;
            }
            return;
        }

        // A newer session owns the slot
        if session.generation != self.generation {
            return;
        }

        let expected = match self.pending {
            Pending::Connect => ConnectionState::Connecting,
            _ => ConnectionState::Disconnecting,
        };
        if self.manager.registry.state(&self.identifier).ok() != Some(expected) {
            return;
        }

        session.cancel_connect = None;
        debug!("{:?} on {} abandoned by caller", self.pending, self.identifier);
        if let Err(e) = self
            .manager
            .transition(&self.identifier, ConnectionState::Disconnected)
        {
            warn!("Could not unwind session for {}: {}", self.identifier, e);
        }
    }
}

/// Manages connection sessions for every device on one adapter.
pub struct ConnectionManager {
    /// Platform adapter.
    adapter: Arc<dyn BleAdapter>,
    /// Shared device registry.
    registry: Arc<DeviceRegistry>,
    /// Session slots by identifier.
    sessions: RwLock<HashMap<DeviceIdentifier, Arc<Mutex<Session>>>>,
    /// Channel for connection events.
    event_tx: broadcast::Sender<ConnectionEvent>,
    /// Default timeouts.
    config: ConnectionConfig,
}

impl ConnectionManager {
    /// Create a connection manager with default timeouts.
    pub fn new(adapter: Arc<dyn BleAdapter>, registry: Arc<DeviceRegistry>) -> Self {
        Self::with_config(adapter, registry, ConnectionConfig::default())
    }

    /// Create a connection manager with explicit timeouts.
    pub fn with_config(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<DeviceRegistry>,
        config: ConnectionConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        Self {
            adapter,
            registry,
            sessions: RwLock::new(HashMap::new()),
            event_tx,
            config,
        }
    }

    /// Get the configured timeouts.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get the current connection state of a device.
    pub fn state(&self, identifier: &DeviceIdentifier) -> Result<ConnectionState> {
        self.registry.state(identifier)
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Connect using the configured connect timeout.
    pub async fn connect(&self, identifier: &DeviceIdentifier) -> Result<()> {
        self.connect_with_timeout(identifier, self.config.connect_timeout)
            .await
    }

    /// Connect to a device.
    ///
    /// Unknown identifiers are registered as known addresses first.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyConnecting`] / [`Error::AlreadyConnected`] if a session
    /// exists, [`Error::Timeout`] if the link is not up within `timeout`, and
    /// [`Error::ConnectFailed`] for every other failure. The device is left
    /// `Disconnected` in all failure cases, and also when the returned future
    /// is dropped before it completes.
    pub async fn connect_with_timeout(
        &self,
        identifier: &DeviceIdentifier,
        timeout: Duration,
    ) -> Result<()> {
        self.registry.ensure(*identifier);
        let slot = self.slot(identifier);

        let (generation, cancelled) = {
            let mut session = slot.lock();
            match self.registry.state(identifier)? {
                ConnectionState::Connecting => return Err(Error::AlreadyConnecting),
                ConnectionState::Connected => return Err(Error::AlreadyConnected),
                ConnectionState::Disconnecting => {
                    return Err(Error::InvalidStateTransition {
                        from: ConnectionState::Disconnecting,
                        to: ConnectionState::Connecting,
                    })
                }
                ConnectionState::Disconnected => {}
            }

            self.transition(identifier, ConnectionState::Connecting)?;
            session.generation += 1;
            session.services = None;
            session.ended_by_link_loss = false;

            let (cancel_tx, cancel_rx) = oneshot::channel();
            session.cancel_connect = Some(cancel_tx);
            (session.generation, cancel_rx)
        };

        let unwind = Unwind::new(
            self,
            *identifier,
            slot.clone(),
            generation,
            Pending::Connect,
        );
        debug!("Connecting to {} (timeout {:?})", identifier, timeout);

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, self.adapter.connect(identifier, timeout)) => {
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(Error::Timeout)) | Err(_) => Err(Error::Timeout),
                    Ok(Err(e @ Error::ConnectFailed { .. })) => Err(e),
                    Ok(Err(e)) => Err(Error::ConnectFailed { reason: e.to_string() }),
                }
            }
            reason = cancelled => Err(Error::ConnectFailed {
                reason: reason.unwrap_or("session ended").to_string(),
            }),
        };

        unwind.disarm();

        let mut session = slot.lock();
        let current = session.generation == generation
            && self.registry.state(identifier).ok() == Some(ConnectionState::Connecting);

        match outcome {
            Ok(()) if current => {
                session.cancel_connect = None;
                self.transition(identifier, ConnectionState::Connected)?;
                info!("Connected to {}", identifier);
                Ok(())
            }
            Ok(()) => Err(Error::ConnectFailed {
                reason: "session ended while connecting".to_string(),
            }),
            Err(e) => {
                if current {
                    session.cancel_connect = None;
                    self.transition(identifier, ConnectionState::Disconnected)?;
                }
                warn!("Connection to {} failed: {}", identifier, e);
                Err(e)
            }
        }
    }

    /// Run service discovery on the current session.
    ///
    /// Replaces any previously discovered set and returns the new one.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] unless the device is connected,
    /// [`Error::OperationInProgress`] if a discovery is already running, and
    /// [`Error::LinkLost`] if the peer dropped the link mid-discovery.
    pub async fn discover_services(
        &self,
        identifier: &DeviceIdentifier,
    ) -> Result<Vec<ServiceDescriptor>> {
        let slot = self.existing_slot(identifier)?;

        let generation = {
            let mut session = slot.lock();
            if !self.registry.state(identifier)?.is_connected() {
                return Err(Error::NotConnected);
            }
            if session.discovering == Some(session.generation) {
                return Err(Error::OperationInProgress {
                    operation: "discover_services",
                });
            }
            session.discovering = Some(session.generation);
            session.generation
        };

        let unwind = Unwind::new(
            self,
            *identifier,
            slot.clone(),
            generation,
            Pending::Discover,
        );
        let result = self.adapter.query_services(identifier).await;
        unwind.disarm();

        {
            let mut session = slot.lock();
            if session.discovering == Some(generation) {
                session.discovering = None;
            }

            let current = session.generation == generation
                && self
                    .registry
                    .state(identifier)
                    .map(|state| state.is_connected())
                    .unwrap_or(false);
            if !current {
                return Err(if session.ended_by_link_loss {
                    Error::LinkLost
                } else {
                    Error::NotConnected
                });
            }

            match result {
                Ok(services) => {
                    debug!("Discovered {} services on {}", services.len(), identifier);
                    session.services = Some(services.clone());
                    return Ok(services);
                }
                Err(Error::LinkLost) => {}
                Err(e) => return Err(e),
            }
        }

        self.handle_link_lost(identifier);
        Err(Error::LinkLost)
    }

    /// Get the services discovered on the current session.
    ///
    /// # Errors
    ///
    /// [`Error::ServicesNotDiscovered`] until [`Self::discover_services`] has
    /// completed on the current session, including after any disconnect.
    pub fn services(&self, identifier: &DeviceIdentifier) -> Result<Vec<ServiceDescriptor>> {
        self.registry.state(identifier)?;
        let slot = match self.sessions.read().get(identifier) {
            Some(slot) => slot.clone(),
            None => return Err(Error::ServicesNotDiscovered),
        };
        let services = slot.lock().services.clone();
        services.ok_or(Error::ServicesNotDiscovered)
    }

    /// Disconnect using the configured disconnect timeout.
    pub async fn disconnect(&self, identifier: &DeviceIdentifier) -> Result<()> {
        self.disconnect_with_timeout(identifier, self.config.disconnect_timeout)
            .await
    }

    /// Disconnect from a device.
    ///
    /// Services are discarded before teardown starts. The device always ends
    /// `Disconnected`, even when teardown fails, times out or the returned
    /// future is dropped; the teardown error is still returned.
    pub async fn disconnect_with_timeout(
        &self,
        identifier: &DeviceIdentifier,
        timeout: Duration,
    ) -> Result<()> {
        let slot = self.existing_slot(identifier)?;

        let (generation, cancel) = {
            let mut session = slot.lock();
            match self.registry.state(identifier)? {
                ConnectionState::Disconnected => return Err(Error::NotConnected),
                ConnectionState::Disconnecting => {
                    return Err(Error::OperationInProgress {
                        operation: "disconnect",
                    })
                }
                ConnectionState::Connecting | ConnectionState::Connected => {}
            }
            let cancel = self.end_session(identifier, &mut session, false)?;
            (session.generation, cancel)
        };

        if let Some(cancel) = cancel {
            let _ = cancel.send("disconnect requested");
        }

        let unwind = Unwind::new(
            self,
            *identifier,
            slot.clone(),
            generation,
            Pending::Disconnect,
        );
        debug!("Tearing down link to {}", identifier);

        let result = match tokio::time::timeout(timeout, self.adapter.disconnect(identifier)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };
        unwind.disarm();

        {
            let _session = slot.lock();
            self.transition(identifier, ConnectionState::Disconnected)?;
        }

        match &result {
            Ok(()) => info!("Disconnected from {}", identifier),
            Err(e) => warn!("Teardown of {} failed: {}", identifier, e),
        }
        result
    }

    /// Handle an unsolicited disconnect reported by the platform.
    ///
    /// Returns `true` if a session was ended.
    pub fn handle_link_lost(&self, identifier: &DeviceIdentifier) -> bool {
        let slot = match self.sessions.read().get(identifier) {
            Some(slot) => slot.clone(),
            None => return false,
        };

        let cancel = {
            let mut session = slot.lock();
            match self.registry.state(identifier) {
                Ok(ConnectionState::Connecting) | Ok(ConnectionState::Connected) => {}
                // A requested teardown is already finishing the session
                _ => return false,
            }

            let cancel = match self.end_session(identifier, &mut session, true) {
                Ok(cancel) => cancel,
                Err(e) => {
                    warn!("Could not end session for {}: {}", identifier, e);
                    return false;
                }
            };
            if let Err(e) = self.transition(identifier, ConnectionState::Disconnected) {
                warn!("Could not finish session for {}: {}", identifier, e);
            }
            cancel
        };

        if let Some(cancel) = cancel {
            let _ = cancel.send("link lost while connecting");
        }

        info!("Link to {} lost", identifier);
        true
    }

    /// Enter `Disconnecting` and drop everything the session owned.
    ///
    /// Shared by requested disconnects and link loss.
    fn end_session(
        &self,
        identifier: &DeviceIdentifier,
        session: &mut Session,
        link_lost: bool,
    ) -> Result<Option<oneshot::Sender<&'static str>>> {
        self.transition(identifier, ConnectionState::Disconnecting)?;
        session.services = None;
        session.generation += 1;
        session.ended_by_link_loss = link_lost;
        Ok(session.cancel_connect.take())
    }

    /// Apply a registry transition and emit an event.
    fn transition(&self, identifier: &DeviceIdentifier, new_state: ConnectionState) -> Result<()> {
        let old_state = self.registry.set_state(identifier, new_state)?;

        if old_state != new_state {
            debug!(
                "Connection state changed for {}: {} -> {}",
                identifier, old_state, new_state
            );

            let _ = self.event_tx.send(ConnectionEvent {
                identifier: *identifier,
                state: new_state,
            });
        }
        Ok(())
    }

    fn slot(&self, identifier: &DeviceIdentifier) -> Arc<Mutex<Session>> {
        if let Some(slot) = self.sessions.read().get(identifier) {
            return slot.clone();
        }
        self.sessions
            .write()
            .entry(*identifier)
            .or_default()
            .clone()
    }

    fn existing_slot(&self, identifier: &DeviceIdentifier) -> Result<Arc<Mutex<Session>>> {
        self.registry.state(identifier)?;
        Ok(self.slot(identifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::adapter::MockBleAdapter;
    use crate::ble::uuids::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DEVICE: DeviceIdentifier =
        DeviceIdentifier::Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

    fn manager(mock: MockBleAdapter) -> ConnectionManager {
        ConnectionManager::new(Arc::new(mock), Arc::new(DeviceRegistry::new()))
    }

    fn services(count: usize) -> Vec<ServiceDescriptor> {
        (0..count)
            .map(|i| ServiceDescriptor::primary(from_u16(0x1800 + i as u16)))
            .collect()
    }

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());

        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(ConnectionState::Disconnecting.is_transitioning());
        assert!(!ConnectionState::Connected.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Connected), "Connected");
        assert_eq!(format!("{}", ConnectionState::Disconnected), "Disconnected");
    }

    #[test]
    fn test_transition_table_has_no_shortcuts() {
        use ConnectionState::*;
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Disconnecting));
        assert!(!Connected.can_transition_to(Disconnected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Disconnecting.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Disconnected));
    }

    #[tokio::test]
    async fn test_connect_failure_rolls_back() {
        let mut mock = MockBleAdapter::new();
        mock.expect_connect().returning(|_, _| {
            Err(Error::ConnectFailed {
                reason: "peer rejected".to_string(),
            })
        });
        let manager = manager(mock);
        let mut events = manager.subscribe();

        let err = manager.connect(&DEVICE).await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { ref reason } if reason == "peer rejected"));
        assert_eq!(manager.state(&DEVICE).unwrap(), ConnectionState::Disconnected);

        assert_eq!(events.try_recv().unwrap().state, ConnectionState::Connecting);
        assert_eq!(events.try_recv().unwrap().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_platform_error_becomes_connect_failed() {
        let mut mock = MockBleAdapter::new();
        mock.expect_connect()
            .returning(|_, _| Err(Error::RadioUnavailable));
        let manager = manager(mock);

        let err = manager.connect(&DEVICE).await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn test_connect_twice_rejected() {
        let mut mock = MockBleAdapter::new();
        mock.expect_connect().times(1).returning(|_, _| Ok(()));
        let manager = manager(mock);

        manager.connect(&DEVICE).await.unwrap();
        assert!(matches!(
            manager.connect(&DEVICE).await,
            Err(Error::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_discover_replaces_set() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut mock = MockBleAdapter::new();
        mock.expect_connect().returning(|_, _| Ok(()));
        mock.expect_query_services().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(services(if n == 0 { 4 } else { 2 }))
        });
        let manager = manager(mock);

        manager.connect(&DEVICE).await.unwrap();
        assert!(matches!(
            manager.services(&DEVICE),
            Err(Error::ServicesNotDiscovered)
        ));

        assert_eq!(manager.discover_services(&DEVICE).await.unwrap().len(), 4);
        assert_eq!(manager.discover_services(&DEVICE).await.unwrap().len(), 2);
        assert_eq!(manager.services(&DEVICE).unwrap().len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_discover_requires_connection() {
        let manager = manager(MockBleAdapter::new());
        assert!(matches!(
            manager.discover_services(&DEVICE).await,
            Err(Error::NotFound { .. })
        ));

        manager.registry.ensure(DEVICE);
        assert!(matches!(
            manager.discover_services(&DEVICE).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_rules() {
        let mut mock = MockBleAdapter::new();
        mock.expect_connect().returning(|_, _| Ok(()));
        mock.expect_query_services().returning(|_| Ok(services(3)));
        mock.expect_disconnect().times(1).returning(|_| Ok(()));
        let manager = manager(mock);

        manager.registry.ensure(DEVICE);
        assert!(matches!(
            manager.disconnect(&DEVICE).await,
            Err(Error::NotConnected)
        ));

        manager.connect(&DEVICE).await.unwrap();
        manager.discover_services(&DEVICE).await.unwrap();
        let mut events = manager.subscribe();

        manager.disconnect(&DEVICE).await.unwrap();

        assert_eq!(manager.state(&DEVICE).unwrap(), ConnectionState::Disconnected);
        assert!(matches!(
            manager.services(&DEVICE),
            Err(Error::ServicesNotDiscovered)
        ));
        assert_eq!(events.try_recv().unwrap().state, ConnectionState::Disconnecting);
        assert_eq!(events.try_recv().unwrap().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_teardown_still_disconnects() {
        let mut mock = MockBleAdapter::new();
        mock.expect_connect().returning(|_, _| Ok(()));
        mock.expect_disconnect().returning(|_| Err(Error::LinkLost));
        let manager = manager(mock);

        manager.connect(&DEVICE).await.unwrap();
        assert!(matches!(manager.disconnect(&DEVICE).await, Err(Error::LinkLost)));
        assert_eq!(manager.state(&DEVICE).unwrap(), ConnectionState::Disconnected);

        // The device can be connected again afterwards
        manager.connect(&DEVICE).await.unwrap();
    }

    #[tokio::test]
    async fn test_link_lost_discards_services() {
        let mut mock = MockBleAdapter::new();
        mock.expect_connect().returning(|_, _| Ok(()));
        mock.expect_query_services().returning(|_| Ok(services(4)));
        let manager = manager(mock);

        assert!(!manager.handle_link_lost(&DEVICE));

        manager.connect(&DEVICE).await.unwrap();
        manager.discover_services(&DEVICE).await.unwrap();
        let mut events = manager.subscribe();

        assert!(manager.handle_link_lost(&DEVICE));
        assert_eq!(manager.state(&DEVICE).unwrap(), ConnectionState::Disconnected);
        assert!(matches!(
            manager.services(&DEVICE),
            Err(Error::ServicesNotDiscovered)
        ));
        assert_eq!(events.try_recv().unwrap().state, ConnectionState::Disconnecting);
        assert_eq!(events.try_recv().unwrap().state, ConnectionState::Disconnected);

        assert!(!manager.handle_link_lost(&DEVICE));
    }

    #[tokio::test]
    async fn test_link_lost_reported_by_query() {
        let mut mock = MockBleAdapter::new();
        mock.expect_connect().returning(|_, _| Ok(()));
        mock.expect_query_services().returning(|_| Err(Error::LinkLost));
        let manager = manager(mock);

        manager.connect(&DEVICE).await.unwrap();
        assert!(matches!(
            manager.discover_services(&DEVICE).await,
            Err(Error::LinkLost)
        ));
        assert_eq!(manager.state(&DEVICE).unwrap(), ConnectionState::Disconnected);
    }
}
