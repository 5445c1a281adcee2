//! Configuration management for ClipShift
//!
//! The core only ever sees a [`BackendConfig`] value. Loading and saving the
//! TOML file lives here for the command-line front end.

use rand::distr::Alphanumeric;
use rand::Rng;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::encryption::CipherMode;
use crate::transport::protocol::ENVELOPE_DELIMITER;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading or writing the config file
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("Failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error
    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Active backend
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Which relay carries clips, and how to reach it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackendConfig {
    /// No backend configured; sends are dropped
    #[default]
    None,

    /// ntfy-style HTTP publish + server-sent events
    #[serde(alias = "ntfy")]
    PushRelay(PushRelayConfig),

    /// nostr-style WebSocket relay with encrypted direct messages
    #[serde(alias = "nostr")]
    SocialRelay(SocialRelayConfig),
}

/// Push relay settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRelayConfig {
    /// Identifier this device publishes under
    #[serde(default = "generate_client_id")]
    pub client_id: String,

    /// Relay base URL, e.g. `https://ntfy.sh`
    pub host: String,

    /// Topic both sides subscribe to
    pub topic: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,

    #[serde(default)]
    pub encryption: EncryptionConfig,
}

/// Social relay settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialRelayConfig {
    /// Identifier this device publishes under
    #[serde(default = "generate_client_id")]
    pub client_id: String,

    /// Relay WebSocket URL, e.g. `wss://relay.damus.io`
    pub host: String,

    /// Hex secp256k1 secret key shared by all devices
    pub private_key: String,

    #[serde(default)]
    pub encryption: EncryptionConfig,
}

/// Optional end-to-end content encryption, available on every backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Pre-shared passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default)]
    pub mode: CipherMode,
}

impl EncryptionConfig {
    /// The passphrase, if one is set and non-empty
    pub fn passphrase(&self) -> Option<&str> {
        self.key.as_deref().filter(|key| !key.is_empty())
    }
}

impl BackendConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, BackendConfig::None)
    }

    pub fn client_id(&self) -> Option<&str> {
        match self {
            BackendConfig::None => None,
            BackendConfig::PushRelay(cfg) => Some(&cfg.client_id),
            BackendConfig::SocialRelay(cfg) => Some(&cfg.client_id),
        }
    }

    pub fn encryption(&self) -> Option<&EncryptionConfig> {
        match self {
            BackendConfig::None => None,
            BackendConfig::PushRelay(cfg) => Some(&cfg.encryption),
            BackendConfig::SocialRelay(cfg) => Some(&cfg.encryption),
        }
    }

    /// Short summary for status output
    pub fn describe(&self) -> String {
        match self {
            BackendConfig::None => "none".to_string(),
            BackendConfig::PushRelay(cfg) => {
                format!("push-relay {}/{}", cfg.host.trim_end_matches('/'), cfg.topic)
            }
            BackendConfig::SocialRelay(cfg) => format!("social-relay {}", cfg.host),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            BackendConfig::None => Ok(()),
            BackendConfig::PushRelay(cfg) => {
                validate_client_id(&cfg.client_id)?;
                validate_url(&cfg.host, &["http", "https"])?;

                let topic = cfg.topic.trim();
                if topic.is_empty() {
                    return Err(ConfigError::Validation("topic must not be empty".to_string()));
                }
                if topic.contains('/') {
                    return Err(ConfigError::Validation(
                        "topic must not contain '/'".to_string(),
                    ));
                }
                Ok(())
            }
            BackendConfig::SocialRelay(cfg) => {
                validate_client_id(&cfg.client_id)?;
                validate_url(&cfg.host, &["ws", "wss"])?;
                secp256k1::SecretKey::from_str(cfg.private_key.trim()).map_err(|_| {
                    ConfigError::Validation(
                        "private_key must be a 64 character hex secp256k1 secret".to_string(),
                    )
                })?;
                Ok(())
            }
        }
    }
}

fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    if client_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "client_id must not be empty".to_string(),
        ));
    }
    // Social relay envelopes split on the first delimiter
    if client_id.contains(ENVELOPE_DELIMITER) {
        return Err(ConfigError::Validation(format!(
            "client_id must not contain '{}'",
            ENVELOPE_DELIMITER
        )));
    }
    Ok(())
}

fn validate_url(raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::Validation(format!("invalid host URL '{}': {}", raw, e)))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Validation(format!(
            "host URL '{}' must use one of: {}",
            raw,
            schemes.join(", ")
        )));
    }
    Ok(())
}

/// Random client id in the form `client-xxxxxxxx`
pub fn generate_client_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("client-{}", suffix)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            backend: BackendConfig::None,
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Checks in order:
    /// 1. Path from CLIPSHIFT_CONFIG environment variable
    /// 2. ~/.config/clipshift/config.toml
    /// 3. Defaults (no backend) if none exists
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration with optional custom path
    pub fn load_config(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) => Self::load_from_path(&expand_path(&path)),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml_str)?;
        config.validate_config()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate_config(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "log_level must be one of: {}",
                LEVELS.join(", ")
            )));
        }
        self.backend.validate()
    }

    /// Path the config is read from and saved to by default
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("clipshift").join("config.toml"))
            .ok_or_else(|| {
                ConfigError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not find config directory",
                ))
            })
    }

    fn find_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CLIPSHIFT_CONFIG") {
            let path = expand_path(Path::new(&path));
            if path.exists() {
                return Some(path);
            }
        }

        Self::default_path().ok().filter(|p| p.exists())
    }

    /// Save configuration to default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path()?;
        self.save_to_path(&path)?;
        Ok(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Write the annotated example to `path`
    pub fn write_example(path: &Path, force: bool) -> Result<(), ConfigError> {
        if !force && path.exists() {
            return Err(ConfigError::Validation(
                "Config file already exists. Use --force to overwrite.".to_string(),
            ));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, Self::generate_example())?;
        Ok(())
    }

    /// Generate example configuration file
    pub fn generate_example() -> String {
        format!(
            r#"# ClipShift Configuration File
# Location: ~/.config/clipshift/config.toml

# Logging level (trace, debug, info, warn, error)
log_level = "info"

# Push relay (ntfy-style) backend
[backend]
type = "push-relay"
# Identifier this device publishes under; must differ per device
client_id = "{client_id}"
host = "https://ntfy.sh"
topic = "change-me"
# Optional relay credentials
# user = "alice"
# pass = "hunter2"

# Optional end-to-end encryption shared by all devices
[backend.encryption]
# key = "correct horse battery staple"
# fixed-iv is compatible with existing peers; random-iv is stronger
mode = "fixed-iv"

# Social relay (nostr-style) backend instead:
# [backend]
# type = "social-relay"
# client_id = "{client_id}"
# host = "wss://relay.damus.io"
# private_key = "<64 hex chars, see `clipshift keygen`>"
"#,
            client_id = generate_client_id()
        )
    }
}

/// Expand tilde in path
pub fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let expanded = shellexpand::tilde(path_str.as_ref());
    PathBuf::from(expanded.into_owned())
}
