//! SSH client session using russh.
//!
//! Handles:
//! - Connecting and authenticating with the key(s) of a resolved host profile
//! - Running remote commands (waited or detached)
//! - Opening direct-tcpip channels for the tunnel
//! - Uploading files over SFTP

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use russh::client::{self, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, ChannelStream, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::agent::authenticate_with_agent;
use crate::error::{Error, Result};
use crate::remote::{CommandOutput, RemoteSession};
use crate::ssh_config::HostProfile;
use crate::tunnel::ChannelOpener;

/// How long a detached launch may take to hand back its channel.
const DETACH_GRACE: Duration = Duration::from_secs(5);

/// Client-side callbacks for russh.
///
/// Unknown host keys are accepted; the fingerprint is logged so it can be
/// compared by hand.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Accepting host key for {}:{} ({})",
            self.host,
            self.port,
            compute_fingerprint_from_pubkey(server_public_key)
        );
        Ok(true)
    }
}

/// Compute fingerprint from raw key bytes (wire format).
pub fn compute_fingerprint_from_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();

    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}

/// Compute the `ssh-keygen -l` style fingerprint of a russh public key.
pub fn compute_fingerprint_from_pubkey(key: &PublicKey) -> String {
    use russh::keys::PublicKeyBase64;
    compute_fingerprint_from_bytes(&key.public_key_bytes())
}

/// One authenticated SSH connection.
pub struct SshSession {
    handle: client::Handle<ClientHandler>,
    profile: HostProfile,
    closed: AtomicBool,
}

impl SshSession {
    /// Connect to the host described by `profile` and authenticate.
    pub async fn connect(profile: HostProfile, timeout: Duration) -> Result<Self> {
        let addr = profile.address();
        info!("Connecting to {} ({})", profile.alias, addr);

        let russh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });

        let handler = ClientHandler {
            host: profile.hostname.clone(),
            port: profile.port,
        };

        let mut handle = tokio::time::timeout(
            timeout,
            // Resolved by tokio; every returned address is tried in turn.
            client::connect(
                russh_config,
                (profile.hostname.as_str(), profile.port),
                handler,
            ),
        )
        .await
        .map_err(|_| Error::Connection(format!("Timed out connecting to {}", addr)))?
        .map_err(|e| Error::Connection(format!("{}: {}", addr, e)))?;

        debug!("SSH handshake with {} completed", addr);

        authenticate(&mut handle, &profile).await?;

        info!("Authenticated to {} as {}", profile.alias, profile.user);

        Ok(Self {
            handle,
            profile,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Connection(format!(
                "Session to {} is closed",
                self.profile.alias
            )));
        }
        Ok(())
    }

    async fn open_session_channel(&self) -> Result<Channel<Msg>> {
        self.ensure_open()?;
        Ok(self.handle.channel_open_session().await?)
    }

    /// Run a command and wait for it to finish.
    pub async fn execute(&self, command: &str) -> Result<CommandOutput> {
        debug!("exec: {}", command);
        let mut channel = self.open_session_channel().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        // Exit status can arrive after EOF, so drain until the channel closes.
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    stderr.extend_from_slice(&data)
                }
                Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                    exit_status = Some(status)
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    /// Launch a command that backgrounds itself; do not wait for it.
    pub async fn spawn_detached(&self, command: &str) -> Result<()> {
        debug!("exec (detached): {}", command);
        let mut channel = self.open_session_channel().await?;
        channel.exec(false, command).await?;

        // The launching shell exits right away once the child is detached.
        let drained = tokio::time::timeout(DETACH_GRACE, async {
            while let Some(msg) = channel.wait().await {
                if matches!(msg, ChannelMsg::Close) {
                    break;
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Detached command did not release its channel within {:?}: {}",
                DETACH_GRACE, command
            );
            let _ = channel.close().await;
        }
        Ok(())
    }

    /// Open a direct-tcpip channel to `host:port` on the remote side.
    pub async fn open_channel(
        &self,
        host: &str,
        port: u16,
        peer: SocketAddr,
    ) -> Result<Channel<Msg>> {
        if self.is_closed() {
            return Err(Error::Channel(format!(
                "Session to {} is closed",
                self.profile.alias
            )));
        }
        self.handle
            .channel_open_direct_tcpip(
                host,
                port as u32,
                peer.ip().to_string(),
                peer.port() as u32,
            )
            .await
            .map_err(|e| Error::Channel(format!("{}:{} refused: {}", host, port, e)))
    }

    async fn open_sftp(&self) -> Result<SftpSession> {
        let channel = self.open_session_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::Deployment(format!("SFTP subsystem unavailable: {}", e)))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::Deployment(format!("SFTP init failed: {}", e)))
    }

    /// Copy a local file to `remote` (relative paths are under the remote
    /// home) and set its permission bits.
    pub async fn upload_file(&self, local: &Path, remote: &str, mode: u32) -> Result<()> {
        let contents = tokio::fs::read(local).await.map_err(|e| {
            Error::Deployment(format!("Failed to read {}: {}", local.display(), e))
        })?;

        let sftp = self.open_sftp().await?;

        if let Some((parent, _)) = remote.rsplit_once('/') {
            for dir in dir_prefixes(parent) {
                if !sftp.try_exists(dir.as_str()).await? {
                    debug!("Creating remote directory {}", dir);
                    sftp.create_dir(dir.as_str()).await?;
                }
            }
        }

        info!(
            "Uploading {} ({} bytes) to {}",
            local.display(),
            contents.len(),
            remote
        );

        let mut file = sftp.create(remote).await?;
        file.write_all(&contents)
            .await
            .map_err(|e| Error::Deployment(format!("Failed to write {}: {}", remote, e)))?;
        file.shutdown()
            .await
            .map_err(|e| Error::Deployment(format!("Failed to close {}: {}", remote, e)))?;

        let mut attrs = FileAttributes::empty();
        attrs.permissions = Some(mode);
        sftp.set_metadata(remote, attrs).await?;

        debug!("Set mode {:o} on {}", mode, remote);

        if let Err(e) = sftp.close().await {
            debug!("Closing SFTP session failed: {}", e);
        }
        Ok(())
    }

    /// Disconnect. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Disconnect from {} failed: {}", self.profile.alias, e);
        }
        info!("Closed session to {}", self.profile.alias);
    }
}

/// Every ancestor of `dir` plus `dir` itself, shortest first, so directories
/// can be created one segment at a time. Empty segments are dropped.
fn dir_prefixes(dir: &str) -> Vec<String> {
    let root = if dir.starts_with('/') { "/" } else { "" };
    let mut prefixes = Vec::new();
    let mut current = String::new();

    for part in dir.split('/').filter(|p| !p.is_empty()) {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(part);
        prefixes.push(format!("{}{}", root, current));
    }
    prefixes
}

/// ssh-agent identities first, then the key files of the profile.
async fn authenticate(handle: &mut client::Handle<ClientHandler>, profile: &HostProfile) -> Result<()> {
    if authenticate_with_agent(handle, &profile.user).await? {
        return Ok(());
    }

    let candidates = profile.identity_candidates();
    if candidates.is_empty() {
        return Err(Error::Authentication(format!(
            "No agent key accepted for {} and no key file found",
            profile.alias
        )));
    }

    let mut last_error = None;
    for key_path in candidates {
        let key = match russh::keys::load_secret_key(&key_path, None) {
            Ok(key) => key,
            Err(russh::keys::Error::KeyIsEncrypted) => {
                warn!(
                    "Key {} is passphrase-protected; add it with ssh-add to use it",
                    key_path.display()
                );
                last_error = Some(format!("{} is encrypted", key_path.display()));
                continue;
            }
            Err(e) => {
                debug!("Skipping key {}: {}", key_path.display(), e);
                last_error = Some(format!("{}: {}", key_path.display(), e));
                continue;
            }
        };

        let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
        let result = handle
            .authenticate_publickey(
                &profile.user,
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await?;

        if result.success() {
            debug!("Authenticated with key {}", key_path.display());
            return Ok(());
        }
        last_error = Some(format!("{} rejected by server", key_path.display()));
    }

    Err(Error::Authentication(last_error.unwrap_or_else(|| {
        "Authentication rejected by server".to_string()
    })))
}

impl RemoteSession for SshSession {
    async fn execute(&self, command: &str) -> Result<CommandOutput> {
        SshSession::execute(self, command).await
    }

    async fn spawn_detached(&self, command: &str) -> Result<()> {
        SshSession::spawn_detached(self, command).await
    }

    async fn upload_file(&self, local: &Path, remote: &str, mode: u32) -> Result<()> {
        SshSession::upload_file(self, local, remote, mode).await
    }

    async fn close(&self) {
        SshSession::close(self).await
    }
}

impl ChannelOpener for SshSession {
    type Stream = ChannelStream<Msg>;

    async fn open_channel(&self, host: &str, port: u16, peer: SocketAddr) -> Result<Self::Stream> {
        let channel = SshSession::open_channel(self, host, port, peer).await?;
        Ok(channel.into_stream())
    }
}
