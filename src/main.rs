//! ClipShift command-line front end

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clipshift::cli::{Cli, CliHandler};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut handler = CliHandler::new(cli.config.clone());

    // Initialize logging; RUST_LOG wins, then --verbose, then the config file
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        handler
            .configured_log_level()
            .unwrap_or_else(|| "info".to_string())
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("clipshift={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!("ClipShift v{}", clipshift::VERSION);

    handler.handle_command(cli.command).await?;

    Ok(())
}
