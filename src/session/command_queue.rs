//! Per-device command FIFO with a single in-flight slot.
//!
//! The queue does no I/O: every method that may put bytes on the air returns
//! them, and the owning session sends them and arms the returned deadline.
//! With at most one command in flight a response always matches the oldest
//! outstanding request.

use std::{collections::VecDeque, time::Duration};

use log::{debug, trace, warn};
use tokio::{sync::oneshot, time::Instant};

use crate::ble::DeviceAddress;
use crate::error::ProvisionError;
use crate::frame_codec::{encode, CommandCode, CommandFrame, ResponseFrame};

pub type CommandResult = std::result::Result<ResponseFrame, ProvisionError>;
pub type Responder<T> = oneshot::Sender<T>;

pub struct CommandRequest {
    pub seq: u64,
    pub frame: CommandFrame,
    pub enqueued_at: Instant,
    pub retries: u32,
    resp: Responder<CommandResult>,
}

impl CommandRequest {
    fn resolve(self, addr: &str, result: CommandResult) {
        if self.resp.send(result).is_err() {
            debug!(
                "Requester of command #{} on {} is gone, result dropped",
                self.seq, addr
            );
        }
    }
}

struct InFlight {
    request: CommandRequest,
    bytes: Vec<u8>,
    deadline: Instant,
}

pub struct CommandQueue {
    addr: DeviceAddress,
    pending: VecDeque<CommandRequest>,
    in_flight: Option<InFlight>,
    next_seq: u64,
    timeout: Duration,
    max_retries: u32,
}

impl CommandQueue {
    pub fn new(addr: DeviceAddress, timeout: Duration, max_retries: u32) -> Self {
        Self {
            addr,
            pending: VecDeque::new(),
            in_flight: None,
            next_seq: 0,
            timeout,
            max_retries,
        }
    }

    /// Appends a command. Returns the bytes to send if the queue was idle.
    pub fn enqueue(
        &mut self, frame: CommandFrame, resp: Responder<CommandResult>,
        now: Instant,
    ) -> Option<Vec<u8>> {
        let seq = self.next_seq;
        self.next_seq += 1;

        trace!("Queueing command #{} {:?} for {}", seq, frame.code(), self.addr);
        self.pending.push_back(CommandRequest {
            seq,
            frame,
            enqueued_at: now,
            retries: 0,
            resp,
        });

        if self.in_flight.is_some() {
            return None;
        }

        self.dispatch_next(now)
    }

    /// Resolves the in-flight command with `response` if the codes match.
    /// Returns the bytes of the next queued command, if any.
    pub fn on_response(
        &mut self, response: ResponseFrame, now: Instant,
    ) -> Option<Vec<u8>> {
        match &self.in_flight {
            Some(in_flight) if in_flight.request.frame.code() == response.code => {
            }
            Some(in_flight) => {
                warn!(
                    "Response {:?} from {} does not match in-flight {:?}, ignored",
                    response.code,
                    self.addr,
                    in_flight.request.frame.code()
                );
                return None;
            }
            None => {
                warn!(
                    "Unsolicited response {:?} from {}, ignored",
                    response.code, self.addr
                );
                return None;
            }
        }

        if let Some(in_flight) = self.in_flight.take() {
            debug!(
                "Command #{} {:?} on {} answered with {:?}",
                in_flight.request.seq,
                response.code,
                self.addr,
                response.status
            );
            in_flight.request.resolve(&self.addr, Ok(response));
        }

        self.dispatch_next(now)
    }

    /// Handles the expiry of the in-flight deadline: re-sends the same frame
    /// while retries remain, otherwise fails the command and moves on.
    pub fn on_timeout(&mut self, now: Instant) -> Option<Vec<u8>> {
        let in_flight = self.in_flight.as_mut()?;
        if in_flight.deadline > now {
            return None;
        }

        if in_flight.request.retries < self.max_retries {
            in_flight.request.retries += 1;
            in_flight.deadline = now + self.timeout;
            debug!(
                "Command #{} {:?} on {} timed out, retry {}/{}",
                in_flight.request.seq,
                in_flight.request.frame.code(),
                self.addr,
                in_flight.request.retries,
                self.max_retries
            );
            return Some(in_flight.bytes.clone());
        }

        if let Some(in_flight) = self.in_flight.take() {
            let code = in_flight.request.frame.code();
            let attempts = in_flight.request.retries + 1;
            warn!(
                "Command #{} {:?} on {} failed after {} attempts",
                in_flight.request.seq, code, self.addr, attempts
            );
            in_flight.request.resolve(
                &self.addr,
                Err(ProvisionError::CommandTimeout {
                    code: code.as_u8(),
                    attempts,
                }),
            );
        }

        self.dispatch_next(now)
    }

    /// Resolves every queued and in-flight command with `error`.
    /// Returns how many commands were resolved.
    pub fn cancel_all(&mut self, error: ProvisionError) -> usize {
        let mut resolved = 0;

        if let Some(in_flight) = self.in_flight.take() {
            in_flight.request.resolve(&self.addr, Err(error.clone()));
            resolved += 1;
        }

        while let Some(request) = self.pending.pop_front() {
            request.resolve(&self.addr, Err(error.clone()));
            resolved += 1;
        }

        if resolved > 0 {
            debug!("{} commands on {} resolved with: {}", resolved, self.addr, error);
        }

        resolved
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|in_flight| in_flight.deadline)
    }

    pub fn in_flight_code(&self) -> Option<CommandCode> {
        self.in_flight.as_ref().map(|in_flight| in_flight.request.frame.code())
    }

    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dispatch_next(&mut self, now: Instant) -> Option<Vec<u8>> {
        let request = self.pending.pop_front()?;
        let bytes = encode(&request.frame);

        trace!(
            "Dispatching command #{} {:?} to {}, queued for {:?}",
            request.seq,
            request.frame.code(),
            self.addr,
            now.saturating_duration_since(request.enqueued_at)
        );

        self.in_flight = Some(InFlight {
            request,
            bytes: bytes.clone(),
            deadline: now + self.timeout,
        });

        Some(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_codec::ResponseStatus;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn queue() -> CommandQueue {
        CommandQueue::new("AA:BB:CC:DD:EE:FF".to_string(), TIMEOUT, 3)
    }

    fn response(code: CommandCode) -> ResponseFrame {
        ResponseFrame { code, status: ResponseStatus::Success, payload: vec![] }
    }

    #[test]
    fn test_second_command_waits_for_first() {
        let mut queue = queue();
        let now = Instant::now();

        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();

        let first = queue.enqueue(
            CommandFrame::empty(CommandCode::GetVersion),
            tx1,
            now,
        );
        let second =
            queue.enqueue(CommandFrame::empty(CommandCode::GetStatus), tx2, now);

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(queue.in_flight_code(), Some(CommandCode::GetVersion));
        assert_eq!(queue.len(), 2);

        let next = queue.on_response(response(CommandCode::GetVersion), now);
        assert_eq!(
            next,
            Some(encode(&CommandFrame::empty(CommandCode::GetStatus)))
        );
        assert!(rx1.try_recv().unwrap().is_ok());
        assert!(rx2.try_recv().is_err());

        assert!(queue.on_response(response(CommandCode::GetStatus), now).is_none());
        assert!(rx2.try_recv().unwrap().is_ok());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_timeout_retries_then_fails() {
        let mut queue = queue();
        let mut now = Instant::now();
        let (tx, mut rx) = oneshot::channel();

        let first = queue
            .enqueue(CommandFrame::empty(CommandCode::ConfigureWifi), tx, now)
            .unwrap();
        let mut attempts = 1;

        loop {
            now += TIMEOUT;
            match queue.on_timeout(now) {
                Some(bytes) => {
                    assert_eq!(bytes, first);
                    attempts += 1;
                }
                None => break,
            }
        }

        assert_eq!(attempts, 4);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(ProvisionError::CommandTimeout {
                code: CommandCode::ConfigureWifi.as_u8(),
                attempts: 4
            })
        );
        assert!(queue.deadline().is_none());
    }

    #[test]
    fn test_early_timeout_is_ignored() {
        let mut queue = queue();
        let now = Instant::now();
        let (tx, _rx) = oneshot::channel();

        queue.enqueue(CommandFrame::empty(CommandCode::GetStatus), tx, now);
        assert!(queue.on_timeout(now + TIMEOUT / 2).is_none());
        assert_eq!(queue.deadline(), Some(now + TIMEOUT));
    }

    #[test]
    fn test_timeout_exhausted_advances_queue() {
        let mut queue = CommandQueue::new("11:22".to_string(), TIMEOUT, 0);
        let now = Instant::now();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        queue.enqueue(CommandFrame::empty(CommandCode::GetVersion), tx1, now);
        queue.enqueue(CommandFrame::empty(CommandCode::GetStatus), tx2, now);

        let next = queue.on_timeout(now + TIMEOUT);
        assert_eq!(
            next,
            Some(encode(&CommandFrame::empty(CommandCode::GetStatus)))
        );
        assert!(matches!(
            rx1.try_recv().unwrap(),
            Err(ProvisionError::CommandTimeout { attempts: 1, .. })
        ));
    }

    #[test]
    fn test_mismatched_response_is_ignored() {
        let mut queue = queue();
        let now = Instant::now();
        let (tx, mut rx) = oneshot::channel();

        queue.enqueue(CommandFrame::empty(CommandCode::GetVersion), tx, now);
        assert!(queue.on_response(response(CommandCode::GetStatus), now).is_none());
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.in_flight_code(), Some(CommandCode::GetVersion));
    }

    #[test]
    fn test_cancel_all_resolves_everything() {
        let mut queue = queue();
        let now = Instant::now();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();

        queue.enqueue(CommandFrame::empty(CommandCode::GetVersion), tx1, now);
        queue.enqueue(CommandFrame::empty(CommandCode::GetStatus), tx2, now);

        assert_eq!(queue.cancel_all(ProvisionError::Cancelled), 2);
        assert_eq!(rx1.try_recv().unwrap(), Err(ProvisionError::Cancelled));
        assert_eq!(rx2.try_recv().unwrap(), Err(ProvisionError::Cancelled));
        assert!(queue.deadline().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dropped_requester_does_not_break_queue() {
        let mut queue = queue();
        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        drop(rx);

        queue.enqueue(CommandFrame::empty(CommandCode::GetVersion), tx, now);
        assert!(queue.on_response(response(CommandCode::GetVersion), now).is_none());
        assert!(queue.is_empty());
    }
}
