//! Reconnection policy for the social relay session
//!
//! A transport error retries quickly, an orderly close from the relay backs
//! off for longer, and an owner-requested close is terminal. At most one
//! reconnect is pending at any time.

use std::time::Duration;
use tracing::{debug, info};

use crate::transport::ConnectionState;

/// Delay before reconnecting after a transport error
pub const ERROR_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Delay before reconnecting after the relay closed the session
pub const CLOSE_RECONNECT_DELAY: Duration = Duration::from_millis(30000);

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionConfig {
    /// Delay after an error (connect failure or socket error)
    pub error_delay: Duration,

    /// Delay after the relay closed the session
    pub close_delay: Duration,

    /// Enable automatic reconnection
    pub enabled: bool,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            error_delay: ERROR_RECONNECT_DELAY,
            close_delay: CLOSE_RECONNECT_DELAY,
            enabled: true,
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// WebSocket handshake completed
    Opened,

    /// Connect attempt failed or the socket errored
    Error,

    /// Relay closed the session
    RemoteClosed,

    /// Owner called `close()`
    CloseRequested,
}

/// What the session task should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Send the subscription request
    Subscribe,

    /// Sleep, then call [`ReconnectionManager::begin_attempt`]
    Reconnect { after: Duration },

    /// Nothing to do
    Ignore,

    /// Terminal; stop the session task
    Stop,
}

/// Connection state machine for one transport instance
#[derive(Debug, Clone)]
pub struct ReconnectionManager {
    config: ReconnectionConfig,
    state: ConnectionState,
    pending: Option<Duration>,
    attempt_count: u32,
    terminal: bool,
}

impl ReconnectionManager {
    pub fn new(config: ReconnectionConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Connecting,
            pending: None,
            attempt_count: 0,
            terminal: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Delay of the reconnect currently scheduled
    pub fn pending_delay(&self) -> Option<Duration> {
        self.pending
    }

    /// Connection attempts made so far, including the first
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Enter `Connecting` for a new attempt. False once terminal.
    pub fn begin_attempt(&mut self) -> bool {
        if self.terminal {
            return false;
        }
        self.pending = None;
        self.state = ConnectionState::Connecting;
        self.attempt_count += 1;
        debug!("Connection attempt {}", self.attempt_count);
        true
    }

    pub fn on_event(&mut self, event: ConnectionEvent) -> ReconnectAction {
        if self.terminal {
            return match event {
                ConnectionEvent::CloseRequested => ReconnectAction::Stop,
                _ => ReconnectAction::Ignore,
            };
        }

        match event {
            ConnectionEvent::Opened => {
                if self.state != ConnectionState::Connecting {
                    return ReconnectAction::Ignore;
                }
                self.state = ConnectionState::Open;
                ReconnectAction::Subscribe
            }
            ConnectionEvent::Error => {
                self.state = ConnectionState::Error;
                self.schedule(self.config.error_delay)
            }
            ConnectionEvent::RemoteClosed => {
                self.state = ConnectionState::Closed;
                self.schedule(self.config.close_delay)
            }
            ConnectionEvent::CloseRequested => {
                self.state = ConnectionState::Closed;
                self.pending = None;
                self.terminal = true;
                ReconnectAction::Stop
            }
        }
    }

    fn schedule(&mut self, delay: Duration) -> ReconnectAction {
        if !self.config.enabled {
            self.terminal = true;
            return ReconnectAction::Stop;
        }
        if self.pending.is_some() {
            // A reconnect is already scheduled; keep the first one
            return ReconnectAction::Ignore;
        }

        info!("Reconnecting in {} ms", delay.as_millis());
        self.pending = Some(delay);
        ReconnectAction::Reconnect { after: delay }
    }
}
