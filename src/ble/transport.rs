//! Boundary between the provisioning core and the radio.
//!
//! Every call returns as soon as the request is handed to the radio. The
//! outcome (link up, discovery done, bytes received, write failed) arrives
//! later as a `LinkEvent` on the channel registered with `connect`, from a
//! task the core does not control.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::device::DeviceAddress;
use crate::error::Result;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Link-level connection established.
    Connected,

    /// Link-level connection could not be established.
    ConnectFailed(String),

    /// The link dropped without being asked to.
    Disconnected,

    /// The required service and characteristics are present.
    ServicesDiscovered,

    DiscoveryFailed(String),

    /// A notification arrived from the device.
    DataReceived(Vec<u8>),

    /// A previously accepted write did not reach the device.
    SendFailed(String),
}

pub type LinkEventSender = mpsc::Sender<LinkEvent>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeviceTransport: Send + Sync + 'static {
    /// Starts connecting to `addr`. All later events of this link are
    /// delivered on `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not even be started, e.g. the
    /// address is not known to the radio.
    async fn connect(
        &self, addr: &DeviceAddress, events: LinkEventSender,
    ) -> Result<()>;

    /// Drops the link. No `Disconnected` event is expected afterwards.
    async fn disconnect(&self, addr: &DeviceAddress) -> Result<()>;

    /// Starts GATT discovery on a connected link.
    async fn discover_services(&self, addr: &DeviceAddress) -> Result<()>;

    /// Queues `bytes` for the write characteristic of the device.
    async fn send(&self, addr: &DeviceAddress, bytes: Vec<u8>) -> Result<()>;
}
