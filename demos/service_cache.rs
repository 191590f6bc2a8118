//! Reconnect example: services must be rediscovered after a disconnect
//!
//! Connects to a device, discovers its services, disconnects, reconnects and
//! shows that the old service set is gone until discovery runs again.
//!
//! Run with: cargo run --example service_cache -- AA:BB:CC:DD:EE:FF
//! Without an address the demo runs against a simulated peer.

use std::sync::Arc;
use std::time::Duration;

use ble_session::ble::uuids::*;
use ble_session::{
    DeviceIdentifier, DeviceManager, Error, Result, ServiceDescriptor, SimulatedAdapter,
    SimulatedPeripheral,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (manager, identifier) = match std::env::args().nth(1) {
        Some(address) => {
            let identifier: DeviceIdentifier = address.parse()?;
            (DeviceManager::with_platform().await?, identifier)
        }
        None => {
            let identifier: DeviceIdentifier = "AA:BB:CC:DD:EE:FF".parse()?;
            let adapter = Arc::new(SimulatedAdapter::new());
            adapter.add_peripheral(
                SimulatedPeripheral::new(identifier, "Simulated").with_services(vec![
                    ServiceDescriptor::primary(GENERIC_ACCESS_SERVICE_UUID),
                    ServiceDescriptor::primary(GENERIC_ATTRIBUTE_SERVICE_UUID),
                    ServiceDescriptor::primary(DEVICE_INFO_SERVICE_UUID),
                    ServiceDescriptor::primary(BATTERY_SERVICE_UUID),
                ]),
            );
            (DeviceManager::new(adapter).await?, identifier)
        }
    };

    println!("Connecting to {}", identifier);
    let device = manager.connect_known(&identifier).await?;
    println!("Connected: {}", device.connection_state);

    let services = manager.discover_services(&identifier).await?;
    println!("Found {} services", services.len());

    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("Disconnecting from {}", identifier);
    manager.disconnect(&identifier).await?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("Reconnecting to {}...", identifier);
    manager.connect_known(&identifier).await?;

    match manager.list_services(&identifier).await {
        Err(Error::ServicesNotDiscovered) => println!("Service cache was cleared"),
        Ok(stale) => println!("Stale service cache: {} services", stale.len()),
        Err(e) => return Err(e),
    }

    let services = manager.discover_services(&identifier).await?;
    println!("Found {} services", services.len());

    manager.disconnect(&identifier).await?;
    manager.shutdown().await?;
    Ok(())
}
