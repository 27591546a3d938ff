mod pipeline;
mod request;
mod status;

pub use pipeline::{Pipeline, Progress, Stage};
pub use request::{
    DeviceHistory, HistorySink, Protocol, ProvisioningRequest,
    ProvisioningResult, ServerConfig, WifiCredentials, MAX_PASSWORD_LEN,
    MAX_SERVER_ADDRESS_LEN, MAX_SSID_LEN,
};
pub use status::{
    DeviceStatus, DeviceStatusReport, FirmwareVersion, OpMode, StationState,
    STATUS_SCHEMA_VERSION,
};

#[cfg(test)]
pub use request::MockHistorySink;
