//! Setup and teardown sequencing for one remote viewer session.
//!
//! `setup()` connects, replaces any previous server instance, deploys and
//! starts the binary, then opens the local tunnel. `cleanup()` undoes it in
//! reverse order and is safe to call at any point.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::config::TunnelConfig;
use crate::error::{Error, Result};
use crate::remote::{RemoteDeployer, RemoteProcessController, RemoteSession};
use crate::ssh::SshSession;
use crate::ssh_config::load_profile;
use crate::tunnel::{ChannelOpener, RelayStats, TunnelRelay, wait_until_ready};

/// Steps of `setup()`, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupStage {
    Connect,
    StopPrevious,
    Deploy,
    Start,
    OpenTunnel,
    AwaitReady,
}

impl SetupStage {
    pub const ALL: [SetupStage; 6] = [
        SetupStage::Connect,
        SetupStage::StopPrevious,
        SetupStage::Deploy,
        SetupStage::Start,
        SetupStage::OpenTunnel,
        SetupStage::AwaitReady,
    ];

    /// Progress message shown while the stage runs.
    pub fn label(self) -> &'static str {
        match self {
            SetupStage::Connect => "Connecting to remote host...",
            SetupStage::StopPrevious => "Stopping previous server...",
            SetupStage::Deploy => "Deploying server binary...",
            SetupStage::Start => "Starting server...",
            SetupStage::OpenTunnel => "Opening tunnel...",
            SetupStage::AwaitReady => "Waiting for server...",
        }
    }
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::Connect => "connect",
            SetupStage::StopPrevious => "stop previous server",
            SetupStage::Deploy => "deploy",
            SetupStage::Start => "start server",
            SetupStage::OpenTunnel => "open tunnel",
            SetupStage::AwaitReady => "await server",
        };
        f.write_str(name)
    }
}

/// Produces a connected, authenticated session.
pub trait Connector: Send + Sync {
    type Session: RemoteSession + ChannelOpener;

    fn connect(&self) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// Connects to a host alias from the OpenSSH client config.
#[derive(Debug, Clone)]
pub struct SshConnector {
    alias: String,
    ssh_config_path: PathBuf,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(alias: impl Into<String>, config: &TunnelConfig) -> Self {
        Self {
            alias: alias.into(),
            ssh_config_path: config.ssh_config_path.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }
}

impl Connector for SshConnector {
    type Session = SshSession;

    async fn connect(&self) -> Result<SshSession> {
        // Resolve first so a bad alias fails before touching the network.
        let profile = load_profile(&self.ssh_config_path, &self.alias).await?;
        SshSession::connect(profile, self.connect_timeout).await
    }
}

/// Owns the session and tunnel of one remote viewer.
pub struct LifecycleCoordinator<C: Connector = SshConnector> {
    connector: C,
    config: Arc<TunnelConfig>,
    session: Option<Arc<C::Session>>,
    tunnel: Option<TunnelRelay>,
}

impl<C: Connector> LifecycleCoordinator<C> {
    pub fn new(connector: C, config: Arc<TunnelConfig>) -> Self {
        Self {
            connector,
            config,
            session: None,
            tunnel: None,
        }
    }

    /// Bring everything up and return the remote home directory.
    ///
    /// Anything left from an earlier call is cleaned up first. On failure the
    /// resources acquired so far stay held until `cleanup()`.
    pub async fn setup(&mut self, progress: Option<UnboundedSender<SetupStage>>) -> Result<String> {
        if self.session.is_some() || self.tunnel.is_some() {
            warn!("Setup called with a live session, cleaning up first");
            self.cleanup().await;
        }

        let report = |stage: SetupStage| {
            info!("{}", stage.label());
            if let Some(tx) = &progress {
                let _ = tx.send(stage);
            }
        };
        let config = self.config.clone();

        report(SetupStage::Connect);
        let session = Arc::new(
            self.connector
                .connect()
                .await
                .map_err(|e| e.in_stage(SetupStage::Connect))?,
        );
        self.session = Some(session.clone());

        let controller = RemoteProcessController::new(session.as_ref(), &config.deploy);

        report(SetupStage::StopPrevious);
        controller
            .stop()
            .await
            .map_err(|e| e.in_stage(SetupStage::StopPrevious))?;

        report(SetupStage::Deploy);
        RemoteDeployer::new(session.as_ref(), &config.deploy)
            .ensure()
            .await
            .map_err(|e| e.in_stage(SetupStage::Deploy))?;

        report(SetupStage::Start);
        controller
            .start()
            .await
            .map_err(|e| e.in_stage(SetupStage::Start))?;

        report(SetupStage::OpenTunnel);
        let tunnel = TunnelRelay::start(session.clone(), &config.tunnel)
            .map_err(|e| e.in_stage(SetupStage::OpenTunnel))?;
        let local_addr = tunnel.local_addr();
        self.tunnel = Some(tunnel);

        let mut last_stage = SetupStage::OpenTunnel;
        if config.readiness.enabled {
            last_stage = SetupStage::AwaitReady;
            report(SetupStage::AwaitReady);
            wait_until_ready(
                session.as_ref(),
                &config.tunnel.remote_host,
                config.tunnel.remote_port,
                &config.readiness,
            )
            .await
            .map_err(|e| e.in_stage(SetupStage::AwaitReady))?;
        }

        // Querying the home directory is the tail of the last stage that ran.
        let home = remote_home(session.as_ref())
            .await
            .map_err(|e| e.in_stage(last_stage))?;
        info!("Remote viewer ready at http://{} (home: {})", local_addr, home);
        Ok(home)
    }

    /// Shut the tunnel, stop the remote server, close the session.
    ///
    /// Never fails; safe before `setup()` and when called repeatedly.
    pub async fn cleanup(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.shutdown().await;
        }

        if let Some(session) = self.session.take() {
            RemoteProcessController::new(session.as_ref(), &self.config.deploy)
                .kill_quietly()
                .await;
            session.close().await;
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tunnel.as_ref().map(TunnelRelay::local_addr)
    }

    /// `http://127.0.0.1:<port>` while the tunnel is open.
    pub fn base_url(&self) -> Option<String> {
        self.local_addr()
            .map(|addr| format!("http://127.0.0.1:{}", addr.port()))
    }

    pub fn relay_stats(&self) -> Option<RelayStats> {
        self.tunnel.as_ref().map(TunnelRelay::stats)
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some() && self.tunnel.as_ref().is_some_and(TunnelRelay::is_running)
    }
}

async fn remote_home<S: RemoteSession>(session: &S) -> Result<String> {
    const COMMAND: &str = "echo $HOME";
    let output = session.execute(COMMAND).await?;
    let home = output.stdout.trim();
    if !output.success() || home.is_empty() {
        return Err(Error::RemoteCommand {
            command: COMMAND.to_string(),
            status: output.exit_status,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(home.to_string())
}
