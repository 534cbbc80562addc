//! sshdaemon
//!
//! Single-user SSH server exposing a sandboxed file tree over SFTP and an
//! interactive shell.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use daemon::config::{default_config_path, ServerConfiguration};
use daemon::orchestrator::{Daemon, DaemonEvent};
use tracing_subscriber::EnvFilter;

/// sshdaemon - single-user SSH/SFTP server.
#[derive(Parser, Debug)]
#[command(name = "sshdaemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides the configuration file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory to serve (overrides the configuration file)
    #[arg(short, long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Refuse every file modification
    #[arg(long)]
    pub read_only: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Applies command-line overrides on top of file and environment values.
    fn apply_overrides(&self, config: &mut ServerConfiguration) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(root) = &self.root {
            config.files.root_dir = root.clone();
        }
        if self.read_only {
            config.files.read_only = true;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = ServerConfiguration::load(&config_path)?;
    cli.apply_overrides(&mut config);

    init_tracing(&config.logging.level, cli.verbose);
    tracing::info!("sshdaemon starting...");
    tracing::debug!("Using config file: {:?}", config_path);

    // Environment variables win over the file; flags win over both.
    config.apply_env_overrides();
    cli.apply_overrides(&mut config);
    config.validate().context("Invalid configuration")?;

    let daemon = Daemon::new(config);
    run(&daemon).await
}

/// Runs the daemon until SIGINT or SIGTERM.
async fn run(daemon: &Daemon) -> anyhow::Result<()> {
    let mut events = daemon.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DaemonEvent::StateChanged(state) => {
                    tracing::debug!("Daemon state: {}", state);
                }
                DaemonEvent::SessionOpened { id, peer } => {
                    tracing::debug!(session = %id, peer = ?peer, "Session opened");
                }
                DaemonEvent::SessionClosed { id } => {
                    tracing::debug!(session = %id, "Session closed");
                }
                DaemonEvent::Error { message } => {
                    tracing::error!("Daemon error: {}", message);
                }
            }
        }
    });

    let addr = daemon.start().await?;
    if let Some(fingerprint) = daemon.fingerprint().await {
        tracing::info!("Listening on {} (host key {})", addr, fingerprint);
    }

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    daemon.stop().await?;
    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_tracing(level: &str, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        std::env::var("SSHDAEMON_LOG_LEVEL")
            .ok()
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| level.to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
