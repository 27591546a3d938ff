//! One task per device owning its link state and command queue.
//!
//! Link events, caller requests, the in-flight deadline and the reconnect
//! timer are all handled by the same task, so the state machine and the
//! queue are never touched concurrently.

mod command_queue;
mod connection;

pub use command_queue::{CommandQueue, CommandRequest, CommandResult};
pub use connection::{ConnectAction, ConnectionState, ConnectionStateMachine};

use std::{future, sync::Arc, time::Duration};

use futures::{future::BoxFuture, FutureExt};
use log::{debug, info, warn};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{sleep_until, Instant},
};

use crate::ble::{DeviceAddress, DeviceTransport, LinkEvent};
use crate::error::ProvisionError;
use crate::frame_codec::{decode, CommandFrame, ResponseFrame};

use command_queue::Responder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub command_timeout: Duration,
    pub max_retries: u32,
    pub reconnect_delay: Duration,
    pub channel_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(5000),
            max_retries: 3,
            reconnect_delay: Duration::from_millis(5000),
            channel_capacity: 64,
        }
    }
}

type ConnectResult = std::result::Result<(), ProvisionError>;

enum SessionCmd {
    Connect { reconnect: bool, resp: Responder<ConnectResult> },
    Send { frame: CommandFrame, resp: Responder<CommandResult> },
    Disconnect { resp: Responder<()> },
    State { resp: Responder<ConnectionState> },
}

/// Handle to the session task of one device. Clones share the task, which
/// tears the link down once the last handle is dropped.
#[derive(Clone)]
pub struct DeviceSession {
    addr: DeviceAddress,
    cmd_tx: mpsc::Sender<SessionCmd>,
    stopped_rx: watch::Receiver<()>,
}

impl DeviceSession {
    pub fn spawn(
        addr: DeviceAddress, transport: Arc<dyn DeviceTransport>,
        settings: SessionSettings,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(settings.channel_capacity);
        let (stopped_tx, stopped_rx) = watch::channel(());

        let actor = SessionActor {
            addr: addr.clone(),
            transport,
            settings,
            fsm: ConnectionStateMachine::new(settings.reconnect_delay),
            queue: CommandQueue::new(
                addr.clone(),
                settings.command_timeout,
                settings.max_retries,
            ),
            connect_waiters: Vec::new(),
            link_rx: None,
            _stopped_tx: stopped_tx,
        };

        tokio::spawn(actor.run(cmd_rx));

        Self { addr, cmd_tx, stopped_rx }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.addr
    }

    /// Brings the link up to `ServiceReady`. With `reconnect` the session
    /// re-establishes the link after an unintended loss.
    pub async fn connect(&self, reconnect: bool) -> ConnectResult {
        let (resp, rx) = oneshot::channel();
        self.request(SessionCmd::Connect { reconnect, resp }, rx).await?
    }

    /// Queues a command and waits for its matching response.
    ///
    /// # Errors
    ///
    /// `ConnectionFailed` if the link is not ready or drops, `CommandTimeout`
    /// once all retries went unanswered, `Cancelled` on disconnect.
    pub async fn send_command(&self, frame: CommandFrame) -> CommandResult {
        let (resp, rx) = oneshot::channel();
        self.request(SessionCmd::Send { frame, resp }, rx).await?
    }

    /// Tears the link down and cancels every pending command. Idempotent.
    pub async fn disconnect(&self) {
        let (resp, rx) = oneshot::channel();
        let _ = self.request(SessionCmd::Disconnect { resp }, rx).await;
    }

    pub async fn state(&self) -> ConnectionState {
        let (resp, rx) = oneshot::channel();
        self.request(SessionCmd::State { resp }, rx)
            .await
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Resolves once the session task has torn the link down and ended,
    /// which happens after the last handle is dropped.
    pub fn stopped(&self) -> BoxFuture<'static, ()> {
        let mut stopped_rx = self.stopped_rx.clone();
        async move {
            //never sent on, closes when the task ends
            while stopped_rx.changed().await.is_ok() {}
        }
        .boxed()
    }

    async fn request<T>(
        &self, cmd: SessionCmd, rx: oneshot::Receiver<T>,
    ) -> std::result::Result<T, ProvisionError> {
        self.cmd_tx.send(cmd).await.map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    fn closed(&self) -> ProvisionError {
        ProvisionError::ConnectionFailed(format!(
            "Session of {} is closed",
            self.addr
        ))
    }
}

struct SessionActor {
    addr: DeviceAddress,
    transport: Arc<dyn DeviceTransport>,
    settings: SessionSettings,
    fsm: ConnectionStateMachine,
    queue: CommandQueue,
    connect_waiters: Vec<Responder<ConnectResult>>,
    //replaced on every link attempt so events of a dropped link are lost
    link_rx: Option<mpsc::Receiver<LinkEvent>>,
    _stopped_tx: watch::Sender<()>,
}

impl SessionActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SessionCmd>) {
        debug!("Session of {} started", self.addr);

        loop {
            let deadline = self.queue.deadline();
            let reconnect_at = self.fsm.reconnect_at();

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.process_cmd(cmd).await,
                        None => {
                            self.teardown().await;
                            break;
                        }
                    }
                }

                Some(event) = recv_link(&mut self.link_rx) => {
                    self.process_link_event(event).await;
                }

                _ = wait_until(deadline) => {
                    if let Some(bytes) = self.queue.on_timeout(Instant::now()) {
                        self.transmit(bytes).await;
                    }
                }

                _ = wait_until(reconnect_at) => {
                    if self.fsm.reconnect_due(Instant::now()) {
                        info!("Reconnecting to {}", self.addr);
                        self.open_link().await;
                    }
                }
            }
        }

        debug!("Session of {} stopped", self.addr);
    }

    async fn process_cmd(&mut self, cmd: SessionCmd) {
        match cmd {
            SessionCmd::Connect { reconnect, resp } => {
                match self.fsm.request_connect(reconnect) {
                    ConnectAction::Ready => {
                        let _ = resp.send(Ok(()));
                    }
                    ConnectAction::Wait => self.connect_waiters.push(resp),
                    ConnectAction::Start => {
                        info!("Connecting to {}", self.addr);
                        self.connect_waiters.push(resp);
                        self.open_link().await;
                    }
                }
            }
            SessionCmd::Send { frame, resp } => {
                if !self.fsm.is_ready() {
                    let _ = resp.send(Err(ProvisionError::ConnectionFailed(
                        format!(
                            "{} is not ready, state {:?}",
                            self.addr,
                            self.fsm.state()
                        ),
                    )));
                    return;
                }

                if let Some(bytes) =
                    self.queue.enqueue(frame, resp, Instant::now())
                {
                    self.transmit(bytes).await;
                }
            }
            SessionCmd::Disconnect { resp } => {
                self.teardown().await;
                let _ = resp.send(());
            }
            SessionCmd::State { resp } => {
                let _ = resp.send(self.fsm.state());
            }
        }
    }

    async fn process_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                if !self.fsm.on_connected() {
                    return;
                }

                debug!("Link up with {}, discovering services", self.addr);
                if let Err(e) = self.transport.discover_services(&self.addr).await
                {
                    self.discovery_failed(e.to_string()).await;
                }
            }
            LinkEvent::ConnectFailed(reason) => {
                if self.fsm.on_setup_failed() {
                    warn!("Connection to {} failed: {}", self.addr, reason);
                    self.link_rx = None;
                    self.resolve_waiters(Err(ProvisionError::ConnectionFailed(
                        reason,
                    )));
                }
            }
            LinkEvent::ServicesDiscovered => {
                if self.fsm.on_services_discovered() {
                    info!("Device {} is ready", self.addr);
                    self.resolve_waiters(Ok(()));
                }
            }
            LinkEvent::DiscoveryFailed(reason) => {
                self.discovery_failed(reason).await;
            }
            LinkEvent::Disconnected => {
                if !self.fsm.on_link_lost(Instant::now()) {
                    return;
                }

                warn!("Link with {} lost", self.addr);
                self.link_rx = None;
                let error =
                    ProvisionError::ConnectionFailed("Link lost".to_string());
                self.queue.cancel_all(error.clone());
                self.resolve_waiters(Err(error));
            }
            LinkEvent::DataReceived(bytes) => {
                if !self.fsm.is_ready() {
                    debug!("Data from {} before services ready", self.addr);
                    return;
                }

                match decode(&bytes) {
                    Ok(response) => self.process_response(response).await,
                    Err(e) => {
                        warn!("Dropping bad frame from {}: {}", self.addr, e)
                    }
                }
            }
            LinkEvent::SendFailed(reason) => {
                //the command stays in flight and is retried on timeout
                warn!("Write to {} failed: {}", self.addr, reason);
            }
        }
    }

    async fn process_response(&mut self, response: ResponseFrame) {
        if let Some(bytes) = self.queue.on_response(response, Instant::now()) {
            self.transmit(bytes).await;
        }
    }

    async fn open_link(&mut self) {
        let (link_tx, link_rx) = mpsc::channel(self.settings.channel_capacity);
        self.link_rx = Some(link_rx);

        if let Err(e) = self.transport.connect(&self.addr, link_tx).await {
            warn!("Cannot start connection to {}: {}", self.addr, e);
            self.fsm.on_setup_failed();
            self.link_rx = None;
            self.resolve_waiters(Err(ProvisionError::ConnectionFailed(
                e.to_string(),
            )));
        }
    }

    async fn discovery_failed(&mut self, reason: String) {
        if !self.fsm.on_setup_failed() {
            return;
        }

        warn!("Service discovery on {} failed: {}", self.addr, reason);
        self.link_rx = None;
        if let Err(e) = self.transport.disconnect(&self.addr).await {
            warn!("Error disconnecting {}: {}", self.addr, e);
        }
        self.resolve_waiters(Err(ProvisionError::ServiceDiscoveryFailed(reason)));
    }

    async fn teardown(&mut self) {
        if self.fsm.request_disconnect() {
            info!("Disconnecting from {}", self.addr);
            if let Err(e) = self.transport.disconnect(&self.addr).await {
                warn!("Error disconnecting {}: {}", self.addr, e);
            }
        }

        self.link_rx = None;
        self.queue.cancel_all(ProvisionError::Cancelled);
        self.resolve_waiters(Err(ProvisionError::Cancelled));
    }

    async fn transmit(&mut self, bytes: Vec<u8>) {
        if let Err(e) = self.transport.send(&self.addr, bytes).await {
            //the in-flight deadline still runs, so this ends in a retry
            warn!("Cannot send to {}: {}", self.addr, e);
        }
    }

    fn resolve_waiters(&mut self, result: ConnectResult) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

async fn recv_link(
    link_rx: &mut Option<mpsc::Receiver<LinkEvent>>,
) -> Option<LinkEvent> {
    match link_rx {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::sim::{Reply, SimTransport};
    use crate::ble::MockDeviceTransport;
    use crate::frame_codec::{CommandCode, ResponseStatus};

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            command_timeout: Duration::from_secs(5),
            max_retries: 3,
            reconnect_delay: Duration::from_secs(2),
            channel_capacity: 16,
        }
    }

    fn spawn(sim: &SimTransport) -> DeviceSession {
        DeviceSession::spawn(ADDR.to_string(), Arc::new(sim.clone()), settings())
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reaches_service_ready() {
        init_logger();
        let sim = SimTransport::new();
        let session = spawn(&sim);

        assert_eq!(session.state().await, ConnectionState::Disconnected);
        session.connect(false).await.unwrap();
        assert_eq!(session.state().await, ConnectionState::ServiceReady);

        //already ready
        session.connect(false).await.unwrap();
        assert_eq!(sim.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_round_trip() {
        init_logger();
        let sim = SimTransport::new();
        sim.reply(CommandCode::GetVersion, Reply::Data(vec![1, 2, 3]));
        let session = spawn(&sim);
        session.connect(false).await.unwrap();

        let response = session
            .send_command(CommandFrame::empty(CommandCode::GetVersion))
            .await
            .unwrap();

        assert_eq!(response.code, CommandCode::GetVersion);
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.payload, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_before_ready_fails() {
        init_logger();
        let sim = SimTransport::new();
        let session = spawn(&sim);

        let result = session
            .send_command(CommandFrame::empty(CommandCode::GetStatus))
            .await;

        assert!(matches!(result, Err(ProvisionError::ConnectionFailed(_))));
        assert!(sim.sent_codes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_are_serialized() {
        init_logger();
        let sim = SimTransport::new();
        let session = spawn(&sim);
        session.connect(false).await.unwrap();

        let first = session.clone();
        let second = session.clone();
        let (a, b) = tokio::join!(
            first.send_command(CommandFrame::empty(CommandCode::GetVersion)),
            second.send_command(CommandFrame::empty(CommandCode::GetStatus)),
        );

        assert_eq!(a.unwrap().code, CommandCode::GetVersion);
        assert_eq!(b.unwrap().code, CommandCode::GetStatus);
        assert_eq!(
            sim.sent_codes(),
            vec![CommandCode::GetVersion, CommandCode::GetStatus]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_responses_are_retried() {
        init_logger();
        let sim = SimTransport::new();
        sim.drop_first(CommandCode::GetStatus, 2);
        let session = spawn(&sim);
        session.connect(false).await.unwrap();

        let response = session
            .send_command(CommandFrame::empty(CommandCode::GetStatus))
            .await
            .unwrap();

        assert_eq!(response.code, CommandCode::GetStatus);
        assert_eq!(sim.sent_codes().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_after_all_attempts() {
        init_logger();
        let sim = SimTransport::new();
        sim.reply(CommandCode::ConfigureWifi, Reply::Silent);
        let session = spawn(&sim);
        session.connect(false).await.unwrap();

        let start = Instant::now();
        let result = session
            .send_command(CommandFrame::empty(CommandCode::ConfigureWifi))
            .await;

        assert_eq!(
            result,
            Err(ProvisionError::CommandTimeout {
                code: CommandCode::ConfigureWifi.as_u8(),
                attempts: 4
            })
        );
        assert_eq!(sim.sent_codes().len(), 4);
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_response_is_dropped() {
        init_logger();
        let sim = SimTransport::new();
        sim.reply(CommandCode::GetStatus, Reply::Silent);
        let session = spawn(&sim);
        session.connect(false).await.unwrap();

        let sender = session.clone();
        let pending = tokio::spawn(async move {
            sender
                .send_command(CommandFrame::empty(CommandCode::GetStatus))
                .await
        });
        sim.wait_sent(1).await;

        //bad checksum, then a valid answer
        sim.push_data(vec![0xAA, 0x02, 0x01, 0x00, 0x00]);
        sim.push_response(CommandCode::GetStatus, vec![0x00, 0x01]);

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.payload, vec![0x01]);
        assert_eq!(sim.sent_codes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_reported() {
        init_logger();
        let sim = SimTransport::new();
        sim.fail_connect("device out of range");
        let session = spawn(&sim);

        let result = session.connect(true).await;
        assert_eq!(
            result,
            Err(ProvisionError::ConnectionFailed(
                "device out of range".to_string()
            ))
        );
        assert_eq!(session.state().await, ConnectionState::Disconnected);

        //no retry after a failed setup
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sim.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_drops_link() {
        init_logger();
        let sim = SimTransport::new();
        sim.fail_discovery("service 0xFFFF missing");
        let session = spawn(&sim);

        let result = session.connect(false).await;
        assert!(matches!(
            result,
            Err(ProvisionError::ServiceDiscoveryFailed(_))
        ));
        assert_eq!(sim.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_fails_pending_and_reconnects() {
        init_logger();
        let sim = SimTransport::new();
        sim.reply(CommandCode::GetStatus, Reply::Silent);
        let session = spawn(&sim);
        session.connect(true).await.unwrap();

        let sender = session.clone();
        let pending = tokio::spawn(async move {
            sender
                .send_command(CommandFrame::empty(CommandCode::GetStatus))
                .await
        });
        sim.wait_sent(1).await;

        sim.drop_link();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ProvisionError::ConnectionFailed(_))));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sim.connects(), 2);
        assert_eq!(session.state().await, ConnectionState::ServiceReady);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_and_stops_reconnect() {
        init_logger();
        let sim = SimTransport::new();
        sim.reply(CommandCode::GetStatus, Reply::Silent);
        let session = spawn(&sim);
        session.connect(true).await.unwrap();

        let sender = session.clone();
        let pending = tokio::spawn(async move {
            sender
                .send_command(CommandFrame::empty(CommandCode::GetStatus))
                .await
        });
        sim.wait_sent(1).await;

        session.disconnect().await;
        assert_eq!(pending.await.unwrap(), Err(ProvisionError::Cancelled));
        assert_eq!(session.state().await, ConnectionState::Disconnected);
        assert_eq!(sim.disconnects(), 1);

        //idempotent
        session.disconnect().await;
        assert_eq!(sim.disconnects(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sim.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_tears_down() {
        init_logger();
        let sim = SimTransport::new();
        let session = spawn(&sim);
        session.connect(false).await.unwrap();

        drop(session);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sim.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_resolves_after_teardown() {
        init_logger();
        let sim = SimTransport::new();
        let session = spawn(&sim);
        session.connect(false).await.unwrap();

        let stopped = session.stopped();
        let clone = session.clone();
        drop(session);

        //a remaining handle keeps the task alive
        let still_running =
            tokio::time::timeout(Duration::from_secs(1), clone.stopped()).await;
        assert!(still_running.is_err());
        assert_eq!(sim.disconnects(), 0);

        drop(clone);
        stopped.await;
        assert_eq!(sim.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_transport_refusing_connect() {
        init_logger();
        let mut transport = MockDeviceTransport::new();
        transport
            .expect_connect()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("unknown device")));
        transport.expect_disconnect().never();

        let session = DeviceSession::spawn(
            ADDR.to_string(),
            Arc::new(transport),
            settings(),
        );

        let result = session.connect(false).await;
        assert_eq!(
            result,
            Err(ProvisionError::ConnectionFailed("unknown device".to_string()))
        );
    }
}
