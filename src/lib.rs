//! Provisioning of BLE peripherals with WiFi and server settings.
//!
//! The core talks to the radio only through [`ble::DeviceTransport`] and
//! [`ble::AdvertisementSource`]; [`ble::BluerTransport`] and
//! [`ble::BluerAdvertisementSource`] implement them over BlueZ.

pub mod ble;
pub mod config;
pub mod error;
pub mod frame_codec;
pub mod provisioner;
pub mod provisioning;
pub mod session;

pub use config::ProvisionerConfig;
pub use error::{DecodeError, EncodeError, ProvisionError};
pub use provisioner::BleProvisioner;
