//! Remote server deployment and process control.
//!
//! Handles:
//! - Uploading the server binary to a fixed path under the remote home
//! - Stopping any previous server instance (pattern kill)
//! - Launching the server detached from the SSH session

use std::future::Future;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::DeployConfig;
use crate::error::{Error, Result};

/// Permission bits for the deployed binary.
pub const BINARY_MODE: u32 = 0o755;

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        matches!(self.exit_status, Some(0) | None)
    }
}

/// Operations the deployer and process controller need from a session.
pub trait RemoteSession: Send + Sync + 'static {
    /// Run `command` and wait for it to complete.
    fn execute(&self, command: &str) -> impl Future<Output = Result<CommandOutput>> + Send;

    /// Launch `command` without waiting for it.
    fn spawn_detached(&self, command: &str) -> impl Future<Output = Result<()>> + Send;

    /// Copy `local` to `remote`, creating parent directories, then chmod.
    fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        mode: u32,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Release the connection. Must be idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Quote a string for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Ensures the server binary is present and executable on the remote host.
pub struct RemoteDeployer<'a, S> {
    session: &'a S,
    config: &'a DeployConfig,
}

impl<'a, S: RemoteSession> RemoteDeployer<'a, S> {
    pub fn new(session: &'a S, config: &'a DeployConfig) -> Self {
        Self { session, config }
    }

    pub fn local_binary(&self) -> &Path {
        &self.config.local_binary
    }

    /// Upload the binary and mark it executable. Safe to repeat.
    pub async fn ensure(&self) -> Result<()> {
        let local = self.local_binary();
        if !tokio::fs::try_exists(local).await.unwrap_or(false) {
            return Err(Error::LocalBinaryMissing(local.to_path_buf()));
        }

        let remote_path = self.config.remote_path();

        if self.config.skip_unchanged && self.remote_matches(local, &remote_path).await {
            info!("Remote {} is up to date, skipping upload", remote_path);
            let output = self
                .session
                .execute(&format!("chmod 755 {}", shell_quote(&remote_path)))
                .await?;
            if !output.success() {
                return Err(Error::Deployment(format!(
                    "chmod {} failed: {}",
                    remote_path,
                    output.stderr.trim()
                )));
            }
            return Ok(());
        }

        self.session
            .upload_file(local, &remote_path, BINARY_MODE)
            .await
            .map_err(|e| match e {
                Error::Deployment(_) => e,
                other => Error::Deployment(other.to_string()),
            })?;

        info!("Deployed {} to {}", local.display(), remote_path);
        Ok(())
    }

    /// Compare the local sha256 with the remote one. Any failure counts as
    /// "different" so the caller falls back to uploading.
    async fn remote_matches(&self, local: &Path, remote_path: &str) -> bool {
        let local_digest = match local_sha256(local).await {
            Ok(d) => d,
            Err(e) => {
                debug!("Could not hash {}: {}", local.display(), e);
                return false;
            }
        };

        let command = format!("sha256sum {} 2>/dev/null", shell_quote(remote_path));
        match self.session.execute(&command).await {
            Ok(output) => output
                .stdout
                .split_whitespace()
                .next()
                .is_some_and(|remote_digest| remote_digest == local_digest),
            Err(e) => {
                debug!("Remote checksum failed: {}", e);
                false
            }
        }
    }
}

/// Hex sha256 of a local file.
pub async fn local_sha256(path: &Path) -> std::io::Result<String> {
    let contents = tokio::fs::read(path).await?;
    let digest = Sha256::digest(&contents);
    Ok(format!("{:x}", digest))
}

/// Stops and starts the remote server process.
pub struct RemoteProcessController<'a, S> {
    session: &'a S,
    config: &'a DeployConfig,
}

impl<'a, S: RemoteSession> RemoteProcessController<'a, S> {
    pub fn new(session: &'a S, config: &'a DeployConfig) -> Self {
        Self { session, config }
    }

    /// `pkill -f` pattern for the deployed binary.
    ///
    /// The first character of the binary name is bracketed so the shell that
    /// runs pkill does not match its own command line.
    pub fn kill_pattern(&self) -> String {
        let dir = self.config.remote_dir.trim_end_matches('/');
        let mut chars = self.config.remote_binary.chars();
        let name = match chars.next() {
            Some(first) => format!("[{}]{}", first, chars.as_str()),
            None => String::new(),
        };
        if dir.is_empty() {
            name
        } else {
            format!("{}/{}", dir, name)
        }
    }

    pub fn kill_command(&self) -> String {
        format!("pkill -f {}", shell_quote(&self.kill_pattern()))
    }

    /// Path as the remote shell sees it; relative paths live under `~`.
    pub fn launch_path(&self) -> String {
        let path = self.config.remote_path();
        if path.starts_with('/') {
            path
        } else {
            format!("~/{}", path)
        }
    }

    pub fn start_command(&self) -> String {
        format!(
            "nohup {} > /dev/null 2>&1 < /dev/null &",
            self.launch_path()
        )
    }

    /// Kill any running instance. "No matching process" is success.
    pub async fn stop(&self) -> Result<()> {
        let command = self.kill_command();
        let output = self.session.execute(&command).await?;

        match output.exit_status {
            Some(0) => info!("Stopped previous {}", self.config.remote_binary),
            Some(1) | None => debug!("No running {} found", self.config.remote_binary),
            Some(status) => {
                return Err(Error::RemoteCommand {
                    command,
                    status: Some(status),
                    stderr: output.stderr.trim().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Launch the deployed binary detached. Does not wait for readiness.
    pub async fn start(&self) -> Result<()> {
        let command = self.start_command();
        self.session.spawn_detached(&command).await?;
        info!("Launched {}", self.launch_path());
        Ok(())
    }

    /// Best-effort stop for teardown paths; never fails.
    pub async fn kill_quietly(&self) {
        if let Err(e) = self.stop().await {
            warn!("Ignoring failure to stop remote server: {}", e);
        }
    }
}
