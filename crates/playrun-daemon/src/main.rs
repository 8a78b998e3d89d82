//! Playrun daemon - automation job runner
//!
//! The daemon provides:
//! - REST API to launch jobs, query runs, fetch logs and kill runs
//! - Server-sent event streams that replay and follow a run's output
//! - An event listener the running tool reports milestones to

use anyhow::Context;
use clap::Parser;
use playrun_daemon::{DaemonConfig, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Playrun daemon CLI
#[derive(Parser)]
#[command(name = "playrund")]
#[command(about = "Playrun daemon - automation job runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "PLAYRUN_CONFIG")]
    config: Option<String>,

    /// Listen address, overriding the configuration file
    #[arg(short, long, env = "PLAYRUN_LISTEN_ADDR")]
    listen: Option<String>,

    /// Log level, overriding the configuration file
    #[arg(long, env = "PLAYRUN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "PLAYRUN_LOG_JSON")]
    json: bool,

    /// Run jobs through the configured mock command
    #[arg(long, env = "PLAYRUN_MOCK")]
    mock: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        DaemonConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json;
    config.runner.mock.enabled |= cli.mock;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", listen))?;
    }

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen_addr,
        log_dir = %config.runner.log_dir.display(),
        mock = config.runner.mock.enabled,
        "Starting playrund"
    );

    let server = Server::new(config)?;
    server.run().await?;
    Ok(())
}
