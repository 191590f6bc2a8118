//! Basic example: scan for nearby BLE devices and print their advertisements
//!
//! Run with: cargo run --example scan_devices -- [duration_ms]

use ble_session::{AdvertisementRecord, DeviceManager, Result, ScanMode};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_session=debug".parse().unwrap()),
        )
        .init();

    let duration_ms = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(2000);

    let manager = DeviceManager::with_platform().await?;

    println!("Scanning for {} ms...", duration_ms);
    let devices = manager.scan(ScanMode::LowPower, duration_ms).await?;

    println!("\n--- Scan Complete ---");
    println!("Total devices found: {}", devices.len());

    for device in devices {
        println!(
            "\n{} {} (RSSI: {:?})",
            device.identifier,
            device.display_name.as_deref().unwrap_or("<unnamed>"),
            device.rssi
        );
        for record in &device.last_advertisement {
            match record {
                AdvertisementRecord::CompleteLocalName(name) => println!("  Name = {}", name),
                AdvertisementRecord::ServiceUuids(list) => {
                    for uuid in list {
                        println!("  Service {}", uuid);
                    }
                }
                AdvertisementRecord::ManufacturerData { company_id, data } => {
                    println!("  Manufacturer {:#06x}: {:02x?}", company_id, &data[..])
                }
                AdvertisementRecord::Unknown { type_code, data } => {
                    println!("  AD {:#04x}: {:02x?}", type_code, &data[..])
                }
            }
        }
    }

    manager.shutdown().await?;
    Ok(())
}
