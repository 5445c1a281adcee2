//! Network transport layer for clip relaying
//!
//! A [`Transport`] publishes clips to a relay and forwards inbound clips into
//! a [`ClipSink`]. Two backends exist: an ntfy-style push relay
//! ([`PushRelayTransport`]) and a nostr-style social relay
//! ([`SocialRelayTransport`]) with automatic reconnection.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;

pub mod protocol;
pub mod push;
pub mod reconnect;
pub mod sse;
pub mod websocket;


use crate::config::BackendConfig;

pub use protocol::{Keys, ProtocolError};
pub use push::PushRelayTransport;
pub use reconnect::{
    ConnectionEvent, ReconnectAction, ReconnectionConfig, ReconnectionManager,
    CLOSE_RECONNECT_DELAY, ERROR_RECONNECT_DELAY,
};
pub use websocket::SocialRelayTransport;

/// Failure to establish or keep a relay connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The configured relay URL cannot be used
    #[error("CS001: Invalid relay URL '{url}': {message}. Check the backend host setting.")]
    InvalidUrl { url: String, message: String },

    /// The social relay secret key cannot be used
    #[error("CS002: Invalid relay key: {0}. Generate one with 'clipshift keygen'.")]
    InvalidKey(#[from] ProtocolError),

    /// HTTP client construction failed
    #[error("CS003: HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend has no transport (type = "none")
    #[error("CS004: No backend configured. Run 'clipshift config init' to create one.")]
    NotConfigured,
}

/// Failure to publish a clip. Never retried.
#[derive(Debug, Error)]
pub enum SendError {
    /// The publish request did not complete
    #[error("CS101: Publish request failed: {0}. Check your network connection.")]
    Http(#[from] reqwest::Error),

    /// The relay answered with a non-success status
    #[error("CS102: Relay rejected the clip with HTTP status {status}.")]
    Rejected { status: u16 },

    /// The WebSocket session is not open right now
    #[error("CS103: Not connected to the relay. The clip was not sent.")]
    NotConnected,

    /// The transport has been closed
    #[error("CS104: Transport is closed.")]
    Closed,

    /// Content encryption produced no ciphertext
    #[error("CS105: Clip could not be encrypted and was not sent.")]
    Encryption,
}

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Send(#[from] SendError),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Connection state as observed by the owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection is being established
    Connecting,

    /// Connection is active and subscribed
    Open,

    /// Last attempt failed; a retry may be pending
    Error,

    /// Connection is closed
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// A clip as it arrives off the wire, before content decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundClip {
    /// Transport instance that produced it
    pub generation: u64,
    pub client: String,
    pub contents: String,
    pub timestamp: i64,
}

/// Outcome of [`ClipSink::deliver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Origin matched the local client id
    SelfEcho,
    /// Nobody is listening any more
    Disconnected,
}

/// Where a transport hands inbound clips
///
/// Applies self-echo suppression so no backend can deliver our own
/// publications back to us.
#[derive(Debug, Clone)]
pub struct ClipSink {
    client_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<InboundClip>,
}

impl ClipSink {
    pub fn new(
        client_id: impl Into<String>,
        generation: u64,
        tx: mpsc::UnboundedSender<InboundClip>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            generation,
            tx,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forward one clip; `timestamp` in ms, receipt time when `None`
    pub fn deliver(&self, origin: &str, contents: String, timestamp: Option<i64>) -> Delivery {
        if origin == self.client_id {
            debug!("Dropping self-echo from {}", origin);
            return Delivery::SelfEcho;
        }

        let clip = InboundClip {
            generation: self.generation,
            client: origin.to_string(),
            contents,
            timestamp: timestamp.unwrap_or_else(now_millis),
        };

        match self.tx.send(clip) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Disconnected,
        }
    }
}

/// Publish/subscribe capability shared by every backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Backend name for logs and status output
    fn kind(&self) -> &'static str;

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Watch connection state changes
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Publish one clip payload (already content-encrypted if configured)
    async fn send_clip(&self, payload: &str) -> std::result::Result<(), SendError>;

    /// Release the channel. Idempotent.
    async fn close(&mut self);
}

/// Builds the transport for a backend configuration
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &BackendConfig,
        sink: ClipSink,
    ) -> std::result::Result<Box<dyn Transport>, ConnectionError>;
}

/// Connector for the built-in relays
#[derive(Debug, Clone, Default)]
pub struct BackendConnector {
    reconnection: ReconnectionConfig,
}

impl BackendConnector {
    pub fn new(reconnection: ReconnectionConfig) -> Self {
        Self { reconnection }
    }
}

#[async_trait]
impl Connector for BackendConnector {
    async fn connect(
        &self,
        config: &BackendConfig,
        sink: ClipSink,
    ) -> std::result::Result<Box<dyn Transport>, ConnectionError> {
        match config {
            BackendConfig::None => Err(ConnectionError::NotConfigured),
            BackendConfig::PushRelay(cfg) => Ok(Box::new(PushRelayTransport::connect(cfg, sink)?)),
            BackendConfig::SocialRelay(cfg) => Ok(Box::new(SocialRelayTransport::connect(
                cfg,
                sink,
                self.reconnection.clone(),
            )?)),
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
