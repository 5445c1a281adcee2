use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::config::{BackendConfig, Config};
use crate::history::Clip;
use crate::sync::ClipBus;
use crate::transport::Keys;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("TARGET"),
    ", ",
    env!("PROFILE"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

const REDACTED: &str = "********";

#[derive(Parser)]
#[command(name = "clipshift")]
#[command(about = "Relay text clips between devices through public relays")]
#[command(version, long_version = LONG_VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Print clips published by other devices until interrupted")]
    Listen {
        /// One JSON object per clip
        #[arg(long)]
        json: bool,
    },

    #[command(about = "Publish one clip")]
    Send {
        /// Clip text; read from stdin when omitted or '-'
        text: Option<String>,

        /// Seconds to wait for the relay connection
        #[arg(short, long, default_value = "10")]
        wait: u64,
    },

    #[command(about = "Generate a social relay private key")]
    Keygen,

    #[command(about = "Configuration management")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    #[command(about = "Show current configuration")]
    Show,

    #[command(about = "Generate example configuration")]
    Init {
        #[arg(long)]
        force: bool,
    },

    #[command(about = "Validate configuration")]
    Validate,
}

pub struct CliHandler {
    config_path: Option<PathBuf>,
    config: Option<Config>,
}

impl CliHandler {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self {
            config_path,
            config: None,
        }
    }

    /// Lazily load the configuration when needed
    fn ensure_config(&mut self) -> Result<&Config> {
        if self.config.is_none() {
            let config = Config::load_config(self.config_path.clone())
                .context("Failed to load configuration")?;
            self.config = Some(config);
        }
        self.config
            .as_ref()
            .context("Configuration was not loaded")
    }

    /// Log level configured in the file, if it can be read
    pub fn configured_log_level(&mut self) -> Option<String> {
        self.ensure_config().ok().map(|config| config.log_level.clone())
    }

    pub async fn handle_command(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::Listen { json } => self.listen(json).await,
            Commands::Send { text, wait } => self.send(text, Duration::from_secs(wait)).await,
            Commands::Keygen => Self::keygen(),
            Commands::Config { action } => self.handle_config_action(action),
        }
    }

    async fn connect(&mut self) -> Result<ClipBus> {
        let backend = self.ensure_config()?.backend.clone();
        if backend.is_none() {
            bail!("No backend configured. Run 'clipshift config init' to create one.");
        }

        let mut bus = ClipBus::new();
        bus.set_config(backend).await?;
        Ok(bus)
    }

    async fn listen(&mut self, json: bool) -> Result<()> {
        let mut bus = self.connect().await?;
        println!("Listening on {} (Ctrl+C to stop)", bus.backend().describe());

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    break;
                }
                clip = bus.process_next() => {
                    if let Some(clip) = clip {
                        print_clip(&clip, json)?;
                    }
                }
            }
        }

        bus.shutdown().await;

        let history = bus.history();
        if !json && !history.is_empty() {
            println!();
            println!("Received clips (newest first):");
            for (index, clip) in history.iter().enumerate() {
                let (when, from) = (clip.received_at(), &clip.client);
                println!("{:>3}. [{}] {}: {}", index + 1, when, from, clip.contents);
            }
        }
        Ok(())
    }

    async fn send(&mut self, text: Option<String>, wait: Duration) -> Result<()> {
        let text = match text.as_deref() {
            None | Some("-") => read_stdin()?,
            Some(text) => text.to_string(),
        };
        if text.is_empty() {
            bail!("Refusing to send an empty clip");
        }

        let mut bus = self.connect().await?;

        // The social relay only publishes over an open session
        if matches!(bus.backend(), BackendConfig::SocialRelay(_))
            && !bus.wait_until_open(wait).await
        {
            bus.shutdown().await;
            bail!("Could not connect to the relay within {} seconds", wait.as_secs());
        }

        let result = bus.send(&text).await;
        bus.shutdown().await;
        result?;

        println!("Sent {} bytes via {}", text.len(), bus.backend().describe());
        Ok(())
    }

    fn keygen() -> Result<()> {
        let keys = Keys::generate();
        println!("private_key = \"{}\"", keys.secret_key_hex());
        println!("# public key: {}", keys.public_key_hex());
        println!("# Use the same private_key on every device that should share clips.");
        Ok(())
    }

    fn handle_config_action(&mut self, action: ConfigAction) -> Result<()> {
        match action {
            ConfigAction::Show => {
                let config = redacted(self.ensure_config()?);
                println!("Current Configuration:");
                print!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigAction::Init { force } => {
                let path = match &self.config_path {
                    Some(path) => crate::config::expand_path(path),
                    None => Config::default_path()?,
                };
                Config::write_example(&path, force)?;
                println!("Example configuration written to {}", path.display());
            }
            ConfigAction::Validate => {
                let config = self.ensure_config()?;
                if config.backend.is_none() {
                    warn!("No backend configured");
                }
                println!("Configuration is valid ({})", config.backend.describe());
            }
        }
        Ok(())
    }
}

fn print_clip(clip: &Clip, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(clip)?);
    } else {
        println!("[{}] {}: {}", clip.received_at(), clip.client, clip.contents);
    }
    Ok(())
}

/// Stdin with a single trailing newline removed
fn read_stdin() -> Result<String> {
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("Failed to read clip from stdin")?;

    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    Ok(text)
}

/// Copy of `config` safe to print
fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    let hide = |secret: &mut Option<String>| {
        if secret.is_some() {
            *secret = Some(REDACTED.to_string());
        }
    };

    match &mut config.backend {
        BackendConfig::None => {}
        BackendConfig::PushRelay(cfg) => {
            hide(&mut cfg.pass);
            hide(&mut cfg.encryption.key);
        }
        BackendConfig::SocialRelay(cfg) => {
            cfg.private_key = REDACTED.to_string();
            hide(&mut cfg.encryption.key);
        }
    }
    config
}
