//! Ordered command sequences run over one device session.
//!
//! Progress is published on a watch channel so the owner can still tell
//! which stage was running after it dropped the pipeline on timeout or
//! cancellation.

use log::{debug, info};
use tokio::sync::watch;

use super::request::ProvisioningRequest;
use super::status::{DeviceStatus, FirmwareVersion};
use crate::error::ProvisionError;
use crate::frame_codec::{CommandCode, CommandFrame, ResponseFrame};
use crate::session::DeviceSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Security,
    Wifi,
    ServerAddress,
    ServerPort,
    Version,
    Status,
}

impl Stage {
    /// Failure of this stage with the given cause.
    pub fn error(self, cause: String) -> ProvisionError {
        match self {
            Stage::Connect => ProvisionError::ConnectionFailed(cause),
            Stage::Security => ProvisionError::SecurityNegotiationFailed(cause),
            Stage::Wifi => ProvisionError::WifiConfigurationFailed(cause),
            Stage::ServerAddress | Stage::ServerPort => {
                ProvisionError::ServerConfigurationFailed(cause)
            }
            Stage::Version | Stage::Status => {
                ProvisionError::StatusQueryFailed(cause)
            }
        }
    }

    /// Lower level errors raised while this stage ran, reported as the
    /// failure of the stage. Cancellation stays visible as such.
    fn wrap(self, error: ProvisionError) -> ProvisionError {
        match error {
            ProvisionError::Cancelled => error,
            other => self.error(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    pub wifi_configured: bool,
    pub server_configured: bool,
}

pub struct Pipeline {
    session: DeviceSession,
    progress: watch::Sender<Progress>,
}

impl Pipeline {
    pub fn new(session: DeviceSession) -> (Self, watch::Receiver<Progress>) {
        let (progress, progress_rx) = watch::channel(Progress {
            stage: Stage::Connect,
            wifi_configured: false,
            server_configured: false,
        });

        (Self { session, progress }, progress_rx)
    }

    /// connect, security, WiFi (optional), server address and port
    /// (optional). The first failure ends the pipeline.
    pub async fn provision(
        &self, request: &ProvisioningRequest,
    ) -> Result<(), ProvisionError> {
        self.connect().await?;

        self.enter(Stage::Security);
        let nonce = uuid::Uuid::new_v4().into_bytes().to_vec();
        self.command(CommandCode::NegotiateSecurity, nonce).await?;

        if let Some(wifi) = &request.wifi {
            self.enter(Stage::Wifi);
            self.command(CommandCode::ConfigureWifi, wifi.to_payload()).await?;
            self.progress.send_modify(|p| p.wifi_configured = true);
            info!("WiFi {} configured on {}", wifi.ssid, self.session.address());
        }

        if let Some(server) = &request.server {
            self.enter(Stage::ServerAddress);
            self.command(CommandCode::SetServerAddress, server.address_payload())
                .await?;

            self.enter(Stage::ServerPort);
            self.command(CommandCode::SetServerPort, server.port_payload())
                .await?;

            self.progress.send_modify(|p| p.server_configured = true);
            info!(
                "Server {}:{} configured on {}",
                server.address,
                server.port,
                self.session.address()
            );
        }

        Ok(())
    }

    /// connect, GET_VERSION, GET_STATUS.
    pub async fn query_status(
        &self,
    ) -> Result<(FirmwareVersion, DeviceStatus), ProvisionError> {
        self.connect().await?;

        self.enter(Stage::Version);
        let response = self.command(CommandCode::GetVersion, vec![]).await?;
        let version = FirmwareVersion::parse(&response.payload)?;

        self.enter(Stage::Status);
        let response = self.command(CommandCode::GetStatus, vec![]).await?;
        let status = DeviceStatus::parse(&response.payload)?;

        Ok((version, status))
    }

    async fn connect(&self) -> Result<(), ProvisionError> {
        self.enter(Stage::Connect);
        self.session.connect(false).await
    }

    async fn command(
        &self, code: CommandCode, payload: Vec<u8>,
    ) -> Result<ResponseFrame, ProvisionError> {
        let stage = self.progress.borrow().stage;

        let frame = CommandFrame::new(code, payload)
            .map_err(|e| stage.wrap(e.into()))?;
        let response = self
            .session
            .send_command(frame)
            .await
            .map_err(|e| stage.wrap(e))?;

        if !response.status.is_success() {
            return Err(stage.error(format!(
                "Device answered {:?} with {:?}",
                code, response.status
            )));
        }

        Ok(response)
    }

    fn enter(&self, stage: Stage) {
        debug!("{}: stage {:?}", self.session.address(), stage);
        self.progress.send_modify(|p| p.stage = stage);
    }
}
