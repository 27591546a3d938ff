//! Runtime configuration of the provisioner.
//!
//! Every timing constant the core relies on lives here so it can be tuned
//! from a JSON file in production and shortened freely in tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use directories::ProjectDirs;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::session::SessionSettings;

/// Environment variable that overrides the default config file location.
pub const CONFIG_PATH_ENV: &str = "BLE_PROVISIONER_CONFIG";

const CONFIG_FILE_NAME: &str = "ble-provisioner.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Time to wait for the response of a single command attempt.
    pub command_timeout_ms: u64,

    /// Re-sends of a command after its first attempt timed out.
    pub max_retries: u32,

    /// Wall-clock bound of a whole provisioning pipeline.
    pub provision_timeout_ms: u64,

    /// Wall-clock bound of a read-only status query.
    pub status_timeout_ms: u64,

    /// A scan session stops by itself after this period.
    pub scan_period_ms: u64,

    /// Delay before reconnecting after an unintended link loss.
    pub reconnect_delay_ms: u64,

    /// Advertised name prefix of the radar family.
    pub radar_name_prefix: String,

    /// Capacity of the internal session and scan channels.
    pub channel_capacity: usize,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5_000,
            max_retries: 3,
            provision_timeout_ms: 20_000,
            status_timeout_ms: 15_000,
            scan_period_ms: 10_000,
            reconnect_delay_ms: 5_000,
            radar_name_prefix: "TSBLU".to_string(),
            channel_capacity: 64,
        }
    }
}

impl ProvisionerConfig {
    /// Reads the configuration from a JSON file. Missing fields keep their
    /// default values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow!("Error reading config file {:?}: {}", path, e)
        })?;

        let config = serde_json::from_str(&raw)?;
        info!("Configuration loaded from {:?}", path);

        Ok(config)
    }

    /// Loads the configuration from `BLE_PROVISIONER_CONFIG` if set, else
    /// from the user config directory. Falls back to the defaults when no
    /// file exists.
    pub async fn load() -> Result<Self> {
        let path = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => default_config_path(),
        };

        match path {
            Some(path) if path.exists() => Self::from_file(&path).await,
            _ => {
                info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_millis(self.provision_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.scan_period_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            command_timeout: self.command_timeout(),
            max_retries: self.max_retries,
            reconnect_delay: self.reconnect_delay(),
            channel_capacity: self.channel_capacity,
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "wisefido", "ble-provisioner")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}
