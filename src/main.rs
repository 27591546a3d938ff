use std::sync::Arc;

use ble_provisioner::{
    ble::{BluerAdvertisementSource, BluerTransport, DeviceFamily, ScanFilter},
    error::Result,
    BleProvisioner, ProvisionerConfig,
};
use futures::StreamExt;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    info!("Starting BLE provisioner");

    let config = ProvisionerConfig::load().await?;

    let session = bluer::Session::new().await?;

    let adapter = session.default_adapter().await?;

    adapter.set_powered(true).await?;

    info!("Using adapter {}", adapter.name());

    let transport = Arc::new(BluerTransport::new(adapter.clone()));
    let source = Arc::new(BluerAdvertisementSource::new(adapter.clone()));

    let name_prefix = config.radar_name_prefix.clone();
    let provisioner = BleProvisioner::new(transport, source, config);

    let mut records = provisioner
        .scan(DeviceFamily::Radar, ScanFilter::Name(name_prefix))
        .await?;

    while let Some(record) = records.next().await {
        info!(
            "Found {} {:?} rssi {:?}",
            record.address, record.name, record.rssi
        );
    }

    info!("Scan finished");

    Ok(())
}
