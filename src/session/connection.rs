//! Link lifecycle of one device, kept free of I/O.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> ServiceReady
//!       ^              |            |              |
//!       +--------------+------------+--------------+
//! ```
//!
//! Commands may only be exchanged in `ServiceReady`. A reconnect is
//! scheduled only when a link that was up drops on its own and the caller
//! asked for it; failures to connect or discover are final.

use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ServiceReady,
}

/// What the session has to do after a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAction {
    /// Ask the transport for a new link.
    Start,
    /// A link is already being set up, wait for it.
    Wait,
    /// Nothing to do.
    Ready,
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    reconnect: bool,
    reconnect_delay: Duration,
    reconnect_at: Option<Instant>,
}

impl ConnectionStateMachine {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect: false,
            reconnect_delay,
            reconnect_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::ServiceReady
    }

    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn request_connect(&mut self, reconnect: bool) -> ConnectAction {
        self.reconnect = reconnect;

        match self.state {
            ConnectionState::Disconnected => {
                self.reconnect_at = None;
                self.transition(ConnectionState::Connecting);
                ConnectAction::Start
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                ConnectAction::Wait
            }
            ConnectionState::ServiceReady => ConnectAction::Ready,
        }
    }

    /// Returns true if service discovery should start.
    pub fn on_connected(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            debug!("Stale connected event in state {:?}", self.state);
            return false;
        }

        self.transition(ConnectionState::Connected);
        true
    }

    /// Returns true if the services became ready by this event.
    pub fn on_services_discovered(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            debug!("Stale discovery event in state {:?}", self.state);
            return false;
        }

        self.transition(ConnectionState::ServiceReady);
        true
    }

    /// Connect or discovery failure. Returns true if a setup was running.
    pub fn on_setup_failed(&mut self) -> bool {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.transition(ConnectionState::Disconnected);
                true
            }
            _ => false,
        }
    }

    /// Unintended link loss. Returns true if a link was being set up or was
    /// up; a reconnect is scheduled when the link was up and the caller
    /// asked for it.
    pub fn on_link_lost(&mut self, now: Instant) -> bool {
        let was_up = matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::ServiceReady
        );
        let was_active = was_up || self.state == ConnectionState::Connecting;

        self.transition(ConnectionState::Disconnected);

        if was_up && self.reconnect {
            let at = now + self.reconnect_delay;
            info!("Reconnect scheduled in {:?}", self.reconnect_delay);
            self.reconnect_at = Some(at);
        }

        was_active
    }

    /// Caller initiated disconnect; cancels any scheduled reconnect.
    /// Returns true if the link has to be torn down.
    pub fn request_disconnect(&mut self) -> bool {
        self.reconnect = false;
        self.reconnect_at = None;

        if self.state == ConnectionState::Disconnected {
            return false;
        }

        self.transition(ConnectionState::Disconnected);
        true
    }

    /// Returns true if the scheduled reconnect is due and the link must be
    /// requested again.
    pub fn reconnect_due(&mut self, now: Instant) -> bool {
        match self.reconnect_at {
            Some(at) if at <= now => {
                self.reconnect_at = None;
                if self.state != ConnectionState::Disconnected {
                    return false;
                }
                self.transition(ConnectionState::Connecting);
                true
            }
            _ => false,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("Connection state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_secs(5);

    fn ready(reconnect: bool) -> ConnectionStateMachine {
        let mut fsm = ConnectionStateMachine::new(DELAY);
        assert_eq!(fsm.request_connect(reconnect), ConnectAction::Start);
        assert!(fsm.on_connected());
        assert!(fsm.on_services_discovered());
        fsm
    }

    #[test]
    fn test_happy_path() {
        let mut fsm = ConnectionStateMachine::new(DELAY);
        assert_eq!(fsm.state(), ConnectionState::Disconnected);

        assert_eq!(fsm.request_connect(false), ConnectAction::Start);
        assert_eq!(fsm.state(), ConnectionState::Connecting);
        assert_eq!(fsm.request_connect(false), ConnectAction::Wait);

        assert!(fsm.on_connected());
        assert_eq!(fsm.state(), ConnectionState::Connected);

        assert!(fsm.on_services_discovered());
        assert!(fsm.is_ready());
        assert_eq!(fsm.request_connect(false), ConnectAction::Ready);
    }

    #[test]
    fn test_out_of_order_events_are_ignored() {
        let mut fsm = ConnectionStateMachine::new(DELAY);
        assert!(!fsm.on_connected());
        assert!(!fsm.on_services_discovered());

        fsm.request_connect(false);
        assert!(!fsm.on_services_discovered());
        assert_eq!(fsm.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_setup_failure_never_reconnects() {
        let mut fsm = ConnectionStateMachine::new(DELAY);
        fsm.request_connect(true);

        assert!(fsm.on_setup_failed());
        assert_eq!(fsm.state(), ConnectionState::Disconnected);
        assert!(fsm.reconnect_at().is_none());
    }

    #[test]
    fn test_link_loss_schedules_reconnect() {
        let mut fsm = ready(true);
        let now = Instant::now();

        assert!(fsm.on_link_lost(now));
        assert_eq!(fsm.state(), ConnectionState::Disconnected);
        assert_eq!(fsm.reconnect_at(), Some(now + DELAY));

        assert!(!fsm.reconnect_due(now));
        assert!(fsm.reconnect_due(now + DELAY));
        assert_eq!(fsm.state(), ConnectionState::Connecting);
        assert!(fsm.reconnect_at().is_none());
    }

    #[test]
    fn test_link_loss_without_reconnect() {
        let mut fsm = ready(false);
        assert!(fsm.on_link_lost(Instant::now()));
        assert!(fsm.reconnect_at().is_none());
    }

    #[test]
    fn test_intentional_disconnect_cancels_reconnect() {
        let mut fsm = ready(true);
        let now = Instant::now();

        fsm.on_link_lost(now);
        assert!(fsm.reconnect_at().is_some());

        assert!(!fsm.request_disconnect());
        assert!(fsm.reconnect_at().is_none());
        assert!(!fsm.reconnect_due(now + DELAY));
    }

    #[test]
    fn test_disconnect_from_ready() {
        let mut fsm = ready(true);
        assert!(fsm.request_disconnect());
        assert_eq!(fsm.state(), ConnectionState::Disconnected);

        //a late loss report does not bring the reconnect back
        assert!(!fsm.on_link_lost(Instant::now()));
        assert!(fsm.reconnect_at().is_none());
    }
}
