//! `DeviceTransport` over BlueZ, using the bluer crate.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use bluer::{
    gatt::remote::Characteristic, Adapter, Address, Device, DeviceEvent,
    DeviceProperty,
};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};

use super::{
    device::DeviceAddress,
    gatt_const::{GattProfile, KNOWN_PROFILES},
    transport::{DeviceTransport, LinkEvent, LinkEventSender},
};
use crate::error::Result;

const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);
const SERVICES_RESOLVE_TRIES: usize = 50;

struct Link {
    device: Device,
    events: LinkEventSender,
    write_char: Option<Characteristic>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

type LinkMap = Arc<Mutex<HashMap<DeviceAddress, Link>>>;

pub struct BluerTransport {
    adapter: Adapter,
    profiles: Vec<GattProfile>,
    links: LinkMap,
}

impl BluerTransport {
    pub fn new(adapter: Adapter) -> Self {
        Self::with_profiles(adapter, KNOWN_PROFILES.to_vec())
    }

    pub fn with_profiles(adapter: Adapter, profiles: Vec<GattProfile>) -> Self {
        Self { adapter, profiles, links: Arc::new(Mutex::new(HashMap::new())) }
    }
}

#[async_trait]
impl DeviceTransport for BluerTransport {
    async fn connect(
        &self, addr: &DeviceAddress, events: LinkEventSender,
    ) -> Result<()> {
        let address: Address = addr
            .parse()
            .map_err(|e| anyhow!("Invalid device address {}: {:?}", addr, e))?;
        let device = self.adapter.device(address)?;

        let task = tokio::spawn(connect_link(device.clone(), events.clone()));

        let link = Link { device, events, write_char: None, tasks: vec![task] };
        if let Some(mut old) = self.links.lock().await.insert(addr.clone(), link)
        {
            warn!("Replacing existing link of device: {}", addr);
            old.abort_tasks();
        }

        Ok(())
    }

    async fn disconnect(&self, addr: &DeviceAddress) -> Result<()> {
        let Some(mut link) = self.links.lock().await.remove(addr) else {
            debug!("Disconnect requested for unknown link: {}", addr);
            return Ok(());
        };

        link.abort_tasks();

        let addr = addr.clone();
        tokio::spawn(async move {
            if let Err(e) = link.device.disconnect().await {
                warn!("Error disconnecting device {}: {}", addr, e);
            } else {
                info!("Device {} disconnected", addr);
            }
        });

        Ok(())
    }

    async fn discover_services(&self, addr: &DeviceAddress) -> Result<()> {
        let (device, events) = {
            let links = self.links.lock().await;
            let link = links
                .get(addr)
                .ok_or(anyhow!("Device {} has no open link", addr))?;
            (link.device.clone(), link.events.clone())
        };

        let task = tokio::spawn(discover_link(
            addr.clone(),
            device,
            self.profiles.clone(),
            events,
            self.links.clone(),
        ));

        if let Some(link) = self.links.lock().await.get_mut(addr) {
            link.tasks.push(task);
        }

        Ok(())
    }

    async fn send(&self, addr: &DeviceAddress, bytes: Vec<u8>) -> Result<()> {
        let (write_char, events) = {
            let links = self.links.lock().await;
            let link = links
                .get(addr)
                .ok_or(anyhow!("Device {} has no open link", addr))?;
            let write_char = link
                .write_char
                .clone()
                .ok_or(anyhow!("Device {} has no write characteristic", addr))?;
            (write_char, link.events.clone())
        };

        tokio::spawn(async move {
            if let Err(e) = write_char.write(&bytes).await {
                let _ = events.send(LinkEvent::SendFailed(e.to_string())).await;
            }
        });

        Ok(())
    }
}

async fn connect_link(device: Device, events: LinkEventSender) {
    //subscribe before connecting so a quick drop is not missed
    let device_events = match device.events().await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Device events unavailable for {}: {}", device.address(), e);
            None
        }
    };

    if let Err(e) = device.connect().await {
        let _ = events.send(LinkEvent::ConnectFailed(e.to_string())).await;
        return;
    }

    if events.send(LinkEvent::Connected).await.is_err() {
        return;
    }

    let Some(device_events) = device_events else { return };
    let mut device_events = Box::pin(device_events);

    while let Some(event) = device_events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) =
            event
        {
            info!("Link lost with device {}", device.address());
            let _ = events.send(LinkEvent::Disconnected).await;
            break;
        }
    }
}

async fn discover_link(
    addr: DeviceAddress, device: Device, profiles: Vec<GattProfile>,
    events: LinkEventSender, links: LinkMap,
) {
    let (write_char, notify_char) = match find_profile(&device, &profiles).await
    {
        Ok(chars) => chars,
        Err(e) => {
            let _ = events.send(LinkEvent::DiscoveryFailed(e.to_string())).await;
            return;
        }
    };

    let notifications = match notify_char.notify().await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events
                .send(LinkEvent::DiscoveryFailed(format!(
                    "Cannot subscribe to notifications: {}",
                    e
                )))
                .await;
            return;
        }
    };

    let forward_events = events.clone();
    let forwarder = tokio::spawn(async move {
        let mut notifications = Box::pin(notifications);
        while let Some(value) = notifications.next().await {
            if forward_events.send(LinkEvent::DataReceived(value)).await.is_err()
            {
                break;
            }
        }
    });

    match links.lock().await.get_mut(&addr) {
        Some(link) => {
            link.write_char = Some(write_char);
            link.tasks.push(forwarder);
        }
        None => {
            //disconnected while discovering
            forwarder.abort();
            return;
        }
    }

    let _ = events.send(LinkEvent::ServicesDiscovered).await;
}

async fn find_profile(
    device: &Device, profiles: &[GattProfile],
) -> Result<(Characteristic, Characteristic)> {
    let mut tries = 0;
    while !device.is_services_resolved().await? {
        tries += 1;
        if tries >= SERVICES_RESOLVE_TRIES {
            return Err(anyhow!("Services were not resolved in time"));
        }
        sleep(SERVICES_RESOLVE_POLL).await;
    }

    for service in device.services().await? {
        let uuid = service.uuid().await?;
        let Some(profile) = profiles.iter().find(|p| p.service == uuid) else {
            continue;
        };

        let mut write_char = None;
        let mut notify_char = None;
        for characteristic in service.characteristics().await? {
            let char_uuid = characteristic.uuid().await?;
            if char_uuid == profile.write_char {
                write_char = Some(characteristic);
            } else if char_uuid == profile.notify_char {
                notify_char = Some(characteristic);
            }
        }

        if let (Some(write_char), Some(notify_char)) = (write_char, notify_char)
        {
            debug!("Provisioning service {} found", uuid);
            return Ok((write_char, notify_char));
        }
    }

    Err(anyhow!("Required provisioning characteristics not found"))
}
