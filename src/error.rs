//! # Error handling utilities.
//! Adapter glue (radio, files, external sinks) keeps the generic anyhow
//! error type. Everything that reaches a caller of the provisioning core is a
//! `ProvisionError`, built with thiserror so each failure keeps its own name.

use thiserror::Error;

pub type Result<T> = anyhow::Result<T>;

/// Reasons a received byte sequence never became a `ResponseFrame`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("bad start byte 0x{0:02x}")]
    BadStart(u8),

    #[error("declared length {declared} but {actual} payload bytes present")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("checksum 0x{received:02x} does not match computed 0x{computed:02x}")]
    ChecksumMismatch { computed: u8, received: u8 },

    #[error("unknown command code 0x{0:02x}")]
    UnknownCommand(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("payload of {0} bytes exceeds the 255 byte frame limit")]
    PayloadTooLong(usize),
}

/// Error taxonomy surfaced by sessions, pipelines and the scan session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("service discovery failed: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid frame: {0}")]
    Encode(#[from] EncodeError),

    #[error("command 0x{code:02x} got no response after {attempts} attempts")]
    CommandTimeout { code: u8, attempts: u32 },

    #[error("security negotiation failed: {0}")]
    SecurityNegotiationFailed(String),

    #[error("wifi configuration failed: {0}")]
    WifiConfigurationFailed(String),

    #[error("server configuration failed: {0}")]
    ServerConfigurationFailed(String),

    #[error("status query failed: {0}")]
    StatusQueryFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProvisionError {
    /// Stable name of the failure, reported as `ProvisioningResult::reason`.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::ScanFailed(_) => "ScanFailed",
            ProvisionError::ConnectionFailed(_) => "ConnectionFailed",
            ProvisionError::ServiceDiscoveryFailed(_) => {
                "ServiceDiscoveryFailed"
            }
            ProvisionError::Decode(_) => "DecodeError",
            ProvisionError::Encode(_) => "EncodeError",
            ProvisionError::CommandTimeout { .. } => "CommandTimeout",
            ProvisionError::SecurityNegotiationFailed(_) => {
                "SecurityNegotiationFailed"
            }
            ProvisionError::WifiConfigurationFailed(_) => {
                "WifiConfigurationFailed"
            }
            ProvisionError::ServerConfigurationFailed(_) => {
                "ServerConfigurationFailed"
            }
            ProvisionError::StatusQueryFailed(_) => "StatusQueryFailed",
            ProvisionError::InvalidRequest(_) => "InvalidRequest",
            ProvisionError::Cancelled => "Cancelled",
        }
    }
}
