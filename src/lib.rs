//! # ClipShift
//!
//! Clip relay library: publish short text clips through a public relay and
//! receive the clips other devices publish to the same channel.
//!
//! Two relay families are supported: an ntfy-style push relay (HTTP publish,
//! server-sent events subscribe) and a nostr-style social relay (WebSocket,
//! NIP-04 direct messages to self). Clip contents can additionally be
//! encrypted end-to-end with a shared passphrase.

pub mod cli;
pub mod config;
pub mod encryption;
pub mod history;
pub mod sync;
pub mod transport;

pub use config::{BackendConfig, Config};
pub use history::Clip;
pub use sync::ClipBus;

/// Result type alias for ClipShift operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ClipShift operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Relay connection error
    #[error("Connection error: {0}")]
    Connection(#[from] transport::ConnectionError),

    /// Publish error
    #[error("Send error: {0}")]
    Send(#[from] transport::SendError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// Content encryption error
    #[error("Encryption error: {0}")]
    Cipher(#[from] encryption::CipherError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
