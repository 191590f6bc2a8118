//! End-to-end session scenarios against the simulated adapter.

use std::sync::Arc;
use std::time::Duration;

use ble_session::ble::simulated::PeerBehavior;
use ble_session::ble::uuids::*;
use ble_session::{
    ConnectionState, DeviceIdentifier, DeviceManager, Error, ScanConfig, ScanMode,
    ServiceDescriptor, SimulatedAdapter, SimulatedPeripheral,
};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use tokio_test::{assert_err, assert_ok};

const PEER: &str = "AA:BB:CC:DD:EE:FF";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn peer_id() -> DeviceIdentifier {
    PEER.parse().unwrap()
}

fn gatt(count: u16) -> Vec<ServiceDescriptor> {
    (0..count)
        .map(|i| ServiceDescriptor::primary(from_u16(0x1800 + i)))
        .collect()
}

async fn setup(peer: SimulatedPeripheral) -> (Arc<SimulatedAdapter>, Arc<DeviceManager>) {
    init_tracing();
    let adapter = Arc::new(SimulatedAdapter::new());
    adapter.add_peripheral(peer);
    let manager = DeviceManager::new(adapter.clone()).await.unwrap();
    (adapter, Arc::new(manager))
}

async fn wait_for_state(manager: &DeviceManager, id: &DeviceIdentifier, state: ConnectionState) {
    for _ in 0..100 {
        if manager.connections().state(id).unwrap() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never reached {}", id, state);
}

#[tokio::test(start_paused = true)]
async fn services_do_not_survive_reconnect() {
    let id = peer_id();
    let peer = SimulatedPeripheral::new(id, "Peer").with_services(gatt(4));
    let (adapter, manager) = setup(peer).await;

    assert_ok!(manager.connect_known(&id).await);
    assert_eq!(manager.discover_services(&id).await.unwrap().len(), 4);

    assert_ok!(manager.disconnect(&id).await);
    assert!(matches!(
        manager.list_services(&id).await,
        Err(Error::ServicesNotDiscovered)
    ));

    adapter.set_services(&id, gatt(6));
    assert_ok!(manager.connect_known(&id).await);
    assert!(matches!(
        manager.list_services(&id).await,
        Err(Error::ServicesNotDiscovered)
    ));

    assert_eq!(manager.discover_services(&id).await.unwrap().len(), 6);
    assert_eq!(manager.list_services(&id).await.unwrap().len(), 6);
    assert_eq!(adapter.query_count(&id), 2);
}

#[tokio::test(start_paused = true)]
async fn services_discarded_before_teardown_completes() {
    let id = peer_id();
    let peer = SimulatedPeripheral::new(id, "Slow")
        .with_services(gatt(3))
        .with_disconnect_latency(Duration::from_secs(1));
    let (_adapter, manager) = setup(peer).await;

    manager.connect_known(&id).await.unwrap();
    manager.discover_services(&id).await.unwrap();

    let task = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.disconnect(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        manager.connections().state(&id).unwrap(),
        ConnectionState::Disconnecting
    );
    assert!(matches!(
        manager.list_services(&id).await,
        Err(Error::ServicesNotDiscovered)
    ));
    assert!(matches!(
        manager.discover_services(&id).await,
        Err(Error::NotConnected)
    ));
    assert!(matches!(
        manager.connect_known(&id).await,
        Err(Error::InvalidStateTransition { .. })
    ));

    assert_ok!(task.await.unwrap());
    assert_eq!(
        manager.connections().state(&id).unwrap(),
        ConnectionState::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn rediscovery_replaces_services() {
    let id = peer_id();
    let peer = SimulatedPeripheral::new(id, "Peer").with_services(gatt(4));
    let (adapter, manager) = setup(peer).await;

    manager.connect_known(&id).await.unwrap();
    assert_eq!(manager.discover_services(&id).await.unwrap().len(), 4);

    adapter.set_services(&id, gatt(2));
    assert_eq!(manager.discover_services(&id).await.unwrap().len(), 2);
    assert_eq!(manager.list_services(&id).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn unresponsive_peer_times_out() {
    let id = peer_id();
    let peer = SimulatedPeripheral::new(id, "Silent").with_behavior(PeerBehavior::Unresponsive);
    let (_adapter, manager) = setup(peer).await;

    let result = manager
        .connections()
        .connect_with_timeout(&id, Duration::from_millis(500))
        .await;

    assert!(matches!(result, Err(Error::Timeout)));
    assert_eq!(
        manager.connections().state(&id).unwrap(),
        ConnectionState::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_connect_rejected() {
    let id = peer_id();
    let (_adapter, manager) = setup(SimulatedPeripheral::new(id, "Peer")).await;

    let (first, second) = tokio::join!(
        manager.connections().connect(&id),
        manager.connections().connect(&id)
    );

    assert_ok!(first);
    assert!(matches!(second, Err(Error::AlreadyConnecting)));
    assert_eq!(
        manager.connections().state(&id).unwrap(),
        ConnectionState::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_connect_rolls_back() {
    let id = peer_id();
    let peer = SimulatedPeripheral::new(id, "Grumpy")
        .with_behavior(PeerBehavior::Reject("insufficient resources".to_string()));
    let (adapter, manager) = setup(peer).await;

    let err = assert_err!(manager.connect_known(&id).await);
    assert!(
        matches!(err, Error::ConnectFailed { ref reason } if reason == "insufficient resources")
    );
    assert_eq!(
        manager.connections().state(&id).unwrap(),
        ConnectionState::Disconnected
    );

    adapter.set_behavior(&id, PeerBehavior::Responsive);
    assert_ok!(manager.connect_known(&id).await);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_connect() {
    let id = peer_id();
    let peer = SimulatedPeripheral::new(id, "Silent").with_behavior(PeerBehavior::Unresponsive);
    let (_adapter, manager) = setup(peer).await;

    let connect = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connections().connect(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        manager.connections().state(&id).unwrap(),
        ConnectionState::Connecting
    );

    assert_ok!(manager.disconnect(&id).await);

    assert!(matches!(
        connect.await.unwrap(),
        Err(Error::ConnectFailed { .. })
    ));
    assert_eq!(
        manager.connections().state(&id).unwrap(),
        ConnectionState::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn peer_disconnect_discards_services() {
    let id = peer_id();
    let peer = SimulatedPeripheral::new(id, "Peer").with_services(gatt(4));
    let (adapter, manager) = setup(peer).await;

    manager.connect_known(&id).await.unwrap();
    manager.discover_services(&id).await.unwrap();

    adapter.drop_link(&id);
    wait_for_state(&manager, &id, ConnectionState::Disconnected).await;

    assert!(matches!(
        manager.list_services(&id).await,
        Err(Error::ServicesNotDiscovered)
    ));
    assert!(matches!(manager.disconnect(&id).await, Err(Error::NotConnected)));

    manager.connect_known(&id).await.unwrap();
    assert!(matches!(
        manager.list_services(&id).await,
        Err(Error::ServicesNotDiscovered)
    ));
}

#[tokio::test(start_paused = true)]
async fn link_lost_during_discovery() {
    let id = peer_id();
    let peer = SimulatedPeripheral::new(id, "Flaky")
        .with_services(gatt(4))
        .with_discovery_latency(Duration::from_millis(200));
    let (adapter, manager) = setup(peer).await;

    manager.connect_known(&id).await.unwrap();

    let discovery = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.discover_services(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(matches!(
        manager.discover_services(&id).await,
        Err(Error::OperationInProgress { .. })
    ));

    adapter.drop_link(&id);

    assert!(matches!(discovery.await.unwrap(), Err(Error::LinkLost)));
    assert_eq!(
        manager.connections().state(&id).unwrap(),
        ConnectionState::Disconnected
    );
    assert!(matches!(
        manager.list_services(&id).await,
        Err(Error::ServicesNotDiscovered)
    ));
}

#[tokio::test(start_paused = true)]
async fn state_history_never_skips() {
    let id = peer_id();
    let peer = SimulatedPeripheral::new(id, "Peer").with_services(gatt(1));
    let (adapter, manager) = setup(peer).await;
    let mut events = manager.subscribe();

    manager.connect_known(&id).await.unwrap();
    manager.discover_services(&id).await.unwrap();
    manager.disconnect(&id).await.unwrap();
    manager.connect_known(&id).await.unwrap();
    adapter.drop_link(&id);
    wait_for_state(&manager, &id, ConnectionState::Disconnected).await;
    adapter.set_behavior(&id, PeerBehavior::Reject("busy".to_string()));
    let _ = manager.connect_known(&id).await;

    let mut history = vec![ConnectionState::Disconnected];
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.identifier, id);
        history.push(event.state);
    }

    assert_eq!(history.len(), 11);
    for pair in history.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "{} -> {} skipped a state",
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test(start_paused = true)]
async fn unrelated_devices_proceed_independently() {
    let slow: DeviceIdentifier = "11:22:33:44:55:66".parse().unwrap();
    let fast = peer_id();
    let (adapter, manager) = setup(SimulatedPeripheral::new(fast, "Fast")).await;
    adapter.add_peripheral(
        SimulatedPeripheral::new(slow, "Slow").with_behavior(PeerBehavior::Unresponsive),
    );

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .connections()
                .connect_with_timeout(&slow, Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_ok!(manager.connect_known(&fast).await);
    assert_eq!(
        manager.connections().state(&slow).unwrap(),
        ConnectionState::Connecting
    );

    assert!(matches!(pending.await.unwrap(), Err(Error::Timeout)));
}

#[tokio::test(start_paused = true)]
async fn scan_exclusive_until_finished() {
    let id = peer_id();
    let (adapter, manager) = setup(SimulatedPeripheral::new(id, "Peer")).await;

    let config = ScanConfig::default().with_duration(Duration::from_millis(300));
    let mut events = manager.start_scan(config.clone()).await.unwrap();
    assert!(matches!(
        manager.start_scan(config.clone()).await,
        Err(Error::ScanAlreadyActive)
    ));

    let first = events.next().await.unwrap();
    assert_eq!(first.identifier, id);

    // Repeats are suppressed, the stream ends at the deadline
    assert!(adapter.advertise(&id));
    assert!(events.next().await.is_none());
    assert!(!manager.is_scanning());
    assert!(!adapter.is_scanning());

    let events = manager.start_scan(config.clone()).await.unwrap();
    manager.stop_scan().await.unwrap();
    let drained: Vec<_> = events.collect().await;
    assert_eq!(drained.len(), 1);

    assert_ok!(manager.start_scan(config).await);
}

#[tokio::test(start_paused = true)]
async fn radio_off_rejects_scan() {
    let (adapter, manager) = setup(SimulatedPeripheral::new(peer_id(), "Peer")).await;
    adapter.set_radio_state(ble_session::RadioState::PoweredOff);

    assert!(matches!(
        manager.scan(ScanMode::LowPower, 2000).await,
        Err(Error::RadioUnavailable)
    ));
}

#[tokio::test(start_paused = true)]
async fn new_scan_keeps_connected_devices() {
    let id = peer_id();
    let other: DeviceIdentifier = "11:22:33:44:55:66".parse().unwrap();
    let (adapter, manager) = setup(SimulatedPeripheral::new(id, "Peer")).await;
    adapter.add_peripheral(SimulatedPeripheral::new(other, "Other"));

    assert_eq!(manager.scan(ScanMode::Balanced, 500).await.unwrap().len(), 2);
    manager.connect_known(&id).await.unwrap();

    let found = manager.scan(ScanMode::Balanced, 500).await.unwrap();

    let connected = found.iter().find(|e| e.identifier == id).unwrap();
    assert_eq!(connected.connection_state, ConnectionState::Connected);
    assert_eq!(manager.connected_devices().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn abandoned_connect_rolls_back() {
    let id = peer_id();
    let peer = SimulatedPeripheral::new(id, "Silent").with_behavior(PeerBehavior::Unresponsive);
    let (adapter, manager) = setup(peer).await;
    let mut events = manager.subscribe();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), manager.connect_known(&id)).await;
    assert!(abandoned.is_err());
    assert_eq!(
        manager.connections().state(&id).unwrap(),
        ConnectionState::Disconnected
    );
    assert_eq!(events.try_recv().unwrap().state, ConnectionState::Connecting);
    assert_eq!(events.try_recv().unwrap().state, ConnectionState::Disconnected);

    adapter.set_behavior(&id, PeerBehavior::Responsive);
    assert_ok!(manager.connect_known(&id).await);
}

#[tokio::test(start_paused = true)]
async fn abandoned_disconnect_still_finishes() {
    let id = peer_id();
    let peer = SimulatedPeripheral::new(id, "Slow")
        .with_services(gatt(2))
        .with_disconnect_latency(Duration::from_secs(10));
    let (_adapter, manager) = setup(peer).await;

    manager.connect_known(&id).await.unwrap();
    manager.discover_services(&id).await.unwrap();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), manager.disconnect(&id)).await;
    assert!(abandoned.is_err());
    assert_eq!(
        manager.connections().state(&id).unwrap(),
        ConnectionState::Disconnected
    );
    assert!(matches!(
        manager.list_services(&id).await,
        Err(Error::ServicesNotDiscovered)
    ));

    assert_ok!(manager.connect_known(&id).await);
    assert!(matches!(
        manager.list_services(&id).await,
        Err(Error::ServicesNotDiscovered)
    ));
}

#[tokio::test(start_paused = true)]
async fn abandoned_discovery_allows_retry() {
    let id = peer_id();
    let peer = SimulatedPeripheral::new(id, "Slow")
        .with_services(gatt(3))
        .with_discovery_latency(Duration::from_secs(2));
    let (_adapter, manager) = setup(peer).await;

    manager.connect_known(&id).await.unwrap();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), manager.discover_services(&id)).await;
    assert!(abandoned.is_err());
    assert_eq!(
        manager.connections().state(&id).unwrap(),
        ConnectionState::Connected
    );

    assert_eq!(manager.discover_services(&id).await.unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn superseded_connect_fails_after_registry_clear() {
    let id = peer_id();
    let peer = SimulatedPeripheral::new(id, "Silent").with_behavior(PeerBehavior::Unresponsive);
    let (_adapter, manager) = setup(peer).await;

    let mut connect = Box::pin(manager.connections().connect(&id));
    assert!(futures::poll!(&mut connect).is_pending());
    assert_ok!(manager.disconnect(&id).await);

    // The peer does not match the filter, so the cleared entry stays gone
    let config = ScanConfig::default().filter_by_service(BATTERY_SERVICE_UUID);
    let _events = manager.start_scan(config).await.unwrap();
    assert!(manager.registry().get(&id).is_err());

    assert!(matches!(connect.await, Err(Error::ConnectFailed { .. })));
}
