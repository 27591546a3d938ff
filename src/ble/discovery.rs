//! Feeds the scan session from BlueZ device discovery.
use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, Address};
use futures::{stream::BoxStream, StreamExt};
use log::{info, warn};

use super::scanner::{Advertisement, AdvertisementSource};
use crate::error::Result;

pub struct BluerAdvertisementSource {
    adapter: Adapter,
}

impl BluerAdvertisementSource {
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl AdvertisementSource for BluerAdvertisementSource {
    async fn advertisements(&self) -> Result<BoxStream<'static, Advertisement>> {
        info!(
            "Using discovery filter:\n{:#?}",
            self.adapter.discovery_filter().await
        );

        let events = self.adapter.discover_devices().await?;
        let adapter = self.adapter.clone();

        let advertisements = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    AdapterEvent::DeviceAdded(addr) => {
                        match query_device(&adapter, addr).await {
                            Ok(adv) => Some(adv),
                            Err(e) => {
                                warn!("Error querying device {}: {}", addr, e);
                                None
                            }
                        }
                    }
                    _ => None,
                }
            }
        });

        Ok(advertisements.boxed())
    }
}

async fn query_device(
    adapter: &Adapter, addr: Address,
) -> bluer::Result<Advertisement> {
    let device = adapter.device(addr)?;

    let service_uuids = device
        .uuids()
        .await?
        .unwrap_or_default()
        .into_iter()
        .map(|uuid| uuid.to_string())
        .collect();

    //BlueZ does not expose the raw PDU, rebuild the manufacturer part of it
    let mut raw = Vec::new();
    if let Some(manufacturer_data) = device.manufacturer_data().await? {
        for (company_id, data) in manufacturer_data {
            raw.extend_from_slice(&company_id.to_le_bytes());
            raw.extend_from_slice(&data);
        }
    }

    Ok(Advertisement {
        address: addr.to_string(),
        name: device.name().await?,
        rssi: device.rssi().await?,
        service_uuids,
        raw,
    })
}
