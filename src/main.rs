//! siview-tunnel
//!
//! Deploys the viewer server to an SSH host, forwards a local port to it,
//! and keeps the tunnel open until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use siview_tunnel::config::{TunnelConfig, default_config_path};
use siview_tunnel::{LifecycleCoordinator, SetupStage, SshConnector};

/// Run the remote image viewer over an SSH tunnel
#[derive(Parser, Debug)]
#[command(name = "siview-tunnel", version, about)]
struct Cli {
    /// Host alias from the ssh config
    #[arg(required_unless_present = "generate_config")]
    host: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override the local port
    #[arg(short = 'p', long)]
    local_port: Option<u16>,

    /// Override the ssh config path
    #[arg(long)]
    ssh_config: Option<PathBuf>,

    /// Override the local server binary
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.generate_config {
        let content = toml::to_string_pretty(&TunnelConfig::default())?;
        println!("{}", content);
        return Ok(());
    }

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let mut config = TunnelConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(port) = cli.local_port {
        config.tunnel.local_port = port;
    }
    if let Some(path) = cli.ssh_config {
        config.ssh_config_path = path;
    }
    if let Some(binary) = cli.binary {
        config.deploy.local_binary = binary;
    }

    let host = cli.host.context("A host alias is required")?;

    let config = Arc::new(config);
    let connector = SshConnector::new(host.as_str(), &config);

    info!("Starting siview-tunnel");
    info!("  Host: {}", connector.alias());
    info!("  SSH config: {}", config.ssh_config_path.display());
    info!("  Server binary: {}", config.deploy.local_binary.display());

    let mut coordinator = LifecycleCoordinator::new(connector, config);

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<SetupStage>();
    let printer = tokio::spawn(async move {
        while let Some(stage) = progress_rx.recv().await {
            println!("{}", stage.label());
        }
    });

    let setup = coordinator.setup(Some(progress_tx)).await;
    // The sender was moved into setup and is gone now, so the printer drains.
    let _ = printer.await;

    let home = match setup {
        Ok(home) => home,
        Err(e) => {
            coordinator.cleanup().await;
            if e.is_configuration() {
                warn!("Check that '{}' is defined in your ssh config", host);
            }
            return Err(e).with_context(|| format!("Failed to set up viewer on {}", host));
        }
    };

    if let Some(url) = coordinator.base_url() {
        println!("Viewer: {}", url);
    }
    println!("Remote home: {}", home);
    println!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    if let Some(stats) = coordinator.relay_stats() {
        info!(
            "Relayed {} connection(s), {} failed, {} bytes out, {} bytes in",
            stats.connections, stats.failed, stats.bytes_to_remote, stats.bytes_to_local
        );
    }
    coordinator.cleanup().await;

    Ok(())
}
