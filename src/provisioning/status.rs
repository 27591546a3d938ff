//! Typed view of the GET_VERSION and GET_STATUS responses.
//!
//! Status data, schema version 1:
//!
//! ```text
//! [schema=1][op_mode][sta_state][softap_conn_count] { [type][len][value] }*
//! ```

use std::{fmt, time::SystemTime};

use serde::{Deserialize, Serialize};

use crate::ble::DeviceAddress;
use crate::error::ProvisionError;

pub const STATUS_SCHEMA_VERSION: u8 = 1;

const TLV_STA_BSSID: u8 = 0x01;
const TLV_STA_SSID: u8 = 0x02;
const TLV_SOFTAP_SSID: u8 = 0x04;
const TLV_SOFTAP_AUTH_MODE: u8 = 0x07;
const TLV_SOFTAP_CHANNEL: u8 = 0x08;
const TLV_STA_END_REASON: u8 = 0x14;
const TLV_STA_RSSI: u8 = 0x15;
const TLV_SERVER_CONNECTED: u8 = 0x20;

fn status_error(msg: impl Into<String>) -> ProvisionError {
    ProvisionError::StatusQueryFailed(msg.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    /// `[major][minor][patch]`, trailing bytes are ignored.
    pub fn parse(data: &[u8]) -> Result<Self, ProvisionError> {
        match data {
            [major, minor, patch, ..] => {
                Ok(Self { major: *major, minor: *minor, patch: *patch })
            }
            _ => Err(status_error(format!(
                "Version needs 3 bytes, got {}",
                data.len()
            ))),
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpMode {
    Null,
    Station,
    SoftAp,
    StationSoftAp,
    Unknown(u8),
}

impl From<u8> for OpMode {
    fn from(value: u8) -> Self {
        match value {
            0 => OpMode::Null,
            1 => OpMode::Station,
            2 => OpMode::SoftAp,
            3 => OpMode::StationSoftAp,
            other => OpMode::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StationState {
    Connected,
    Disconnected,
    Connecting,
    ConnectedNoIp,
    Unknown(u8),
}

impl From<u8> for StationState {
    fn from(value: u8) -> Self {
        match value {
            0 => StationState::Connected,
            1 => StationState::Disconnected,
            2 => StationState::Connecting,
            3 => StationState::ConnectedNoIp,
            other => StationState::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub op_mode: OpMode,
    pub sta_state: StationState,
    pub softap_conn_count: u8,
    pub sta_bssid: Option<String>,
    pub sta_ssid: Option<String>,
    pub softap_ssid: Option<String>,
    pub softap_auth_mode: Option<u8>,
    pub softap_channel: Option<u8>,
    pub sta_end_reason: Option<u8>,
    pub sta_rssi: Option<i8>,
    pub server_connected: Option<bool>,
}

impl DeviceStatus {
    fn new(op_mode: u8, sta_state: u8, softap_conn_count: u8) -> Self {
        Self {
            op_mode: op_mode.into(),
            sta_state: sta_state.into(),
            softap_conn_count,
            sta_bssid: None,
            sta_ssid: None,
            softap_ssid: None,
            softap_auth_mode: None,
            softap_channel: None,
            sta_end_reason: None,
            sta_rssi: None,
            server_connected: None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProvisionError> {
        let (header, mut rest) = match data {
            [schema, op_mode, sta_state, conn_count, rest @ ..] => {
                if *schema != STATUS_SCHEMA_VERSION {
                    return Err(status_error(format!(
                        "Unsupported status schema {}",
                        schema
                    )));
                }
                ((*op_mode, *sta_state, *conn_count), rest)
            }
            _ => {
                return Err(status_error(format!(
                    "Status header needs 4 bytes, got {}",
                    data.len()
                )))
            }
        };

        let mut status = DeviceStatus::new(header.0, header.1, header.2);

        while !rest.is_empty() {
            let [kind, len, tail @ ..] = rest else {
                return Err(status_error("Truncated status entry header"));
            };
            let len = *len as usize;
            if tail.len() < len {
                return Err(status_error(format!(
                    "Status entry 0x{:02x} declares {} bytes, {} left",
                    kind,
                    len,
                    tail.len()
                )));
            }

            let (value, next) = tail.split_at(len);
            status.apply(*kind, value)?;
            rest = next;
        }

        Ok(status)
    }

    fn apply(&mut self, kind: u8, value: &[u8]) -> Result<(), ProvisionError> {
        let first = || {
            value.first().copied().ok_or_else(|| {
                status_error(format!("Status entry 0x{:02x} is empty", kind))
            })
        };

        match kind {
            TLV_STA_BSSID => {
                let bssid: Vec<String> =
                    value.iter().map(|b| format!("{:02x}", b)).collect();
                self.sta_bssid = Some(bssid.join(":"));
            }
            TLV_STA_SSID => {
                self.sta_ssid = Some(String::from_utf8_lossy(value).into_owned())
            }
            TLV_SOFTAP_SSID => {
                self.softap_ssid =
                    Some(String::from_utf8_lossy(value).into_owned())
            }
            TLV_SOFTAP_AUTH_MODE => self.softap_auth_mode = Some(first()?),
            TLV_SOFTAP_CHANNEL => self.softap_channel = Some(first()?),
            TLV_STA_END_REASON => self.sta_end_reason = Some(first()?),
            TLV_STA_RSSI => self.sta_rssi = Some(first()? as i8),
            TLV_SERVER_CONNECTED => self.server_connected = Some(first()? != 0),
            //newer firmware may report more
            _ => {}
        }

        Ok(())
    }
}

/// Outcome of a read-only status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusReport {
    pub address: DeviceAddress,
    pub version: FirmwareVersion,
    pub status: DeviceStatus,
    pub queried_at: SystemTime,
}
