use std::{fmt, time::SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ble::{DeviceAddress, DeviceFamily, DeviceHandle};
use crate::error::{ProvisionError, Result};

#[cfg(test)]
use mockall::automock;

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 64;
pub const MAX_SERVER_ADDRESS_LEN: usize = 255;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self { ssid: ssid.into(), password: password.into() }
    }

    fn validate(&self) -> std::result::Result<(), ProvisionError> {
        if self.ssid.is_empty() || self.ssid.len() > MAX_SSID_LEN {
            return Err(ProvisionError::InvalidRequest(format!(
                "SSID must be 1 to {} bytes, got {}",
                MAX_SSID_LEN,
                self.ssid.len()
            )));
        }

        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(ProvisionError::InvalidRequest(format!(
                "Password must be at most {} bytes",
                MAX_PASSWORD_LEN
            )));
        }

        Ok(())
    }

    /// `[ssid_len][ssid][password]`
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload =
            Vec::with_capacity(1 + self.ssid.len() + self.password.len());
        //ssid length bounded by validate
        payload.push(self.ssid.len() as u8);
        payload.extend_from_slice(self.ssid.as_bytes());
        payload.extend_from_slice(self.password.as_bytes());
        payload
    }
}

impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"********")
            .finish()
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn code(self) -> u8 {
        match self {
            Protocol::Tcp => 0,
            Protocol::Udp => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl ServerConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self { address: address.into(), port, protocol: Protocol::Tcp }
    }

    fn validate(&self) -> std::result::Result<(), ProvisionError> {
        if self.address.is_empty()
            || self.address.len() > MAX_SERVER_ADDRESS_LEN
        {
            return Err(ProvisionError::InvalidRequest(format!(
                "Server address must be 1 to {} bytes",
                MAX_SERVER_ADDRESS_LEN
            )));
        }

        if self.port == 0 {
            return Err(ProvisionError::InvalidRequest(
                "Server port must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn address_payload(&self) -> Vec<u8> {
        self.address.as_bytes().to_vec()
    }

    /// `[port_hi][port_lo][protocol]`
    pub fn port_payload(&self) -> Vec<u8> {
        let [hi, lo] = self.port.to_be_bytes();
        vec![hi, lo, self.protocol.code()]
    }
}

/// Desired end state of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRequest {
    pub target: DeviceHandle,
    pub wifi: Option<WifiCredentials>,
    pub server: Option<ServerConfig>,
}

impl ProvisioningRequest {
    pub fn new(target: DeviceHandle) -> Self {
        Self { target, wifi: None, server: None }
    }

    pub fn with_wifi(mut self, wifi: WifiCredentials) -> Self {
        self.wifi = Some(wifi);
        self
    }

    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = Some(server);
        self
    }

    pub fn address(&self) -> &DeviceAddress {
        self.target.address()
    }

    /// Checks the request before any radio activity.
    pub fn validate(&self) -> std::result::Result<(), ProvisionError> {
        if self.wifi.is_none() && self.server.is_none() {
            return Err(ProvisionError::InvalidRequest(
                "Nothing to configure".to_string(),
            ));
        }

        if let Some(wifi) = &self.wifi {
            wifi.validate()?;
        }

        if let Some(server) = &self.server {
            server.validate()?;
        }

        if let DeviceHandle::Sleepace(_) = self.target {
            match &self.server {
                Some(server) if self.wifi.is_some() => {
                    if server.protocol != Protocol::Tcp {
                        return Err(ProvisionError::InvalidRequest(
                            "Sleepace devices only support TCP".to_string(),
                        ));
                    }
                }
                _ => {
                    return Err(ProvisionError::InvalidRequest(
                        "Sleepace devices need both WiFi and server settings"
                            .to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Terminal outcome of one provisioning request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningResult {
    pub address: DeviceAddress,
    pub success: bool,
    /// `"Success"` or the name of the failure kind.
    pub reason: String,
    pub error: Option<ProvisionError>,
    pub wifi_configured: bool,
    pub server_configured: bool,
    pub completed_at: SystemTime,
}

impl ProvisioningResult {
    pub fn succeeded(
        address: DeviceAddress, wifi_configured: bool, server_configured: bool,
    ) -> Self {
        Self {
            address,
            success: true,
            reason: "Success".to_string(),
            error: None,
            wifi_configured,
            server_configured,
            completed_at: SystemTime::now(),
        }
    }

    pub fn failed(
        address: DeviceAddress, error: ProvisionError, wifi_configured: bool,
        server_configured: bool,
    ) -> Self {
        Self {
            address,
            success: false,
            reason: error.kind().to_string(),
            error: Some(error),
            wifi_configured,
            server_configured,
            completed_at: SystemTime::now(),
        }
    }
}

/// What a storage layer keeps about a provisioned device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHistory {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub family: DeviceFamily,
    pub provisioned_at: SystemTime,
    pub wifi: Option<WifiCredentials>,
    pub server: Option<ServerConfig>,
}

impl DeviceHistory {
    pub fn from_request(request: &ProvisioningRequest) -> Self {
        Self {
            address: request.address().clone(),
            name: request.target.name().map(str::to_string),
            family: request.target.family(),
            provisioned_at: SystemTime::now(),
            wifi: request.wifi.clone(),
            server: request.server.clone(),
        }
    }
}

/// Receives a record of every successfully provisioned device.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HistorySink: Send + Sync + 'static {
    async fn record(&self, entry: DeviceHistory) -> Result<()>;
}
