//! In-memory peripheral used by the session and provisioner tests.
//!
//! Answers every command the way a cooperative device would unless told
//! otherwise, and records what reached the air.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use super::{
    device::DeviceAddress,
    transport::{DeviceTransport, LinkEvent, LinkEventSender},
};
use crate::error::Result;
use crate::frame_codec::{encode, CommandCode, CommandFrame, FRAME_OVERHEAD};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Success status without data.
    Accept,
    /// Only the given status byte.
    Status(u8),
    /// Success status followed by data.
    Data(Vec<u8>),
    /// No answer at all.
    Silent,
}

#[derive(Default)]
struct SimState {
    events: Option<LinkEventSender>,
    replies: HashMap<CommandCode, Reply>,
    drops: HashMap<CommandCode, u32>,
    fail_connect: Option<String>,
    fail_discovery: Option<String>,
    sent: Vec<(CommandCode, Vec<u8>)>,
    connects: usize,
    disconnects: usize,
}

#[derive(Clone, Default)]
pub(crate) struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(&self, code: CommandCode, reply: Reply) {
        self.lock().replies.insert(code, reply);
    }

    /// Swallows the first `count` transmissions of `code`.
    pub(crate) fn drop_first(&self, code: CommandCode, count: u32) {
        self.lock().drops.insert(code, count);
    }

    pub(crate) fn fail_connect(&self, reason: &str) {
        self.lock().fail_connect = Some(reason.to_string());
    }

    pub(crate) fn fail_discovery(&self, reason: &str) {
        self.lock().fail_discovery = Some(reason.to_string());
    }

    pub(crate) fn sent(&self) -> Vec<(CommandCode, Vec<u8>)> {
        self.lock().sent.clone()
    }

    pub(crate) fn sent_codes(&self) -> Vec<CommandCode> {
        self.lock().sent.iter().map(|(code, _)| *code).collect()
    }

    pub(crate) fn connects(&self) -> usize {
        self.lock().connects
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.lock().disconnects
    }

    /// Waits until at least `count` frames were sent.
    pub(crate) async fn wait_sent(&self, count: usize) {
        while self.lock().sent.len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// The device walks away.
    pub(crate) fn drop_link(&self) {
        let events = self.lock().events.take();
        if let Some(events) = events {
            let _ = events.try_send(LinkEvent::Disconnected);
        }
    }

    pub(crate) fn push_data(&self, bytes: Vec<u8>) {
        self.emit(LinkEvent::DataReceived(bytes));
    }

    /// `payload` starts with the status byte.
    pub(crate) fn push_response(&self, code: CommandCode, payload: Vec<u8>) {
        let frame = CommandFrame::new(code, payload).unwrap();
        self.push_data(encode(&frame));
    }

    fn emit(&self, event: LinkEvent) {
        let events = self.lock().events.clone();
        if let Some(events) = events {
            let _ = events.try_send(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl DeviceTransport for SimTransport {
    async fn connect(
        &self, _addr: &DeviceAddress, events: LinkEventSender,
    ) -> Result<()> {
        let mut state = self.lock();
        state.connects += 1;

        let event = match &state.fail_connect {
            Some(reason) => LinkEvent::ConnectFailed(reason.clone()),
            None => LinkEvent::Connected,
        };
        let _ = events.try_send(event);
        state.events = Some(events);

        Ok(())
    }

    async fn disconnect(&self, _addr: &DeviceAddress) -> Result<()> {
        let mut state = self.lock();
        state.disconnects += 1;
        state.events = None;
        Ok(())
    }

    async fn discover_services(&self, _addr: &DeviceAddress) -> Result<()> {
        let event = match &self.lock().fail_discovery {
            Some(reason) => LinkEvent::DiscoveryFailed(reason.clone()),
            None => LinkEvent::ServicesDiscovered,
        };
        self.emit(event);
        Ok(())
    }

    async fn send(&self, _addr: &DeviceAddress, bytes: Vec<u8>) -> Result<()> {
        let code = CommandCode::try_from(bytes[1])?;
        let payload = bytes[3..bytes.len() - 1].to_vec();
        assert_eq!(bytes.len(), payload.len() + FRAME_OVERHEAD);

        let reply = {
            let mut state = self.lock();
            state.sent.push((code, payload));

            match state.drops.get_mut(&code) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    return Ok(());
                }
                _ => {}
            }

            state.replies.get(&code).cloned().unwrap_or(Reply::Accept)
        };

        match reply {
            Reply::Accept => self.push_response(code, vec![0x00]),
            Reply::Status(status) => self.push_response(code, vec![status]),
            Reply::Data(data) => {
                let mut payload = vec![0x00];
                payload.extend(data);
                self.push_response(code, payload);
            }
            Reply::Silent => {}
        }

        Ok(())
    }
}
