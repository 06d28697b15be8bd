//! In-memory stand-ins for an SSH host, plus small TCP servers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use siview_tunnel::config::TunnelConfig;
use siview_tunnel::error::{Error, Result};
use siview_tunnel::lifecycle::Connector;
use siview_tunnel::remote::{CommandOutput, RemoteSession};
use siview_tunnel::tunnel::ChannelOpener;

pub const HOME: &str = "/home/tester";

#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub contents: Vec<u8>,
    pub mode: u32,
}

#[derive(Debug, Default)]
pub struct HostState {
    pub files: HashMap<String, RemoteFile>,
    pub running: bool,
    pub commands: Vec<String>,
    pub uploads: usize,
    /// Channel opens to refuse before accepting.
    pub refuse_channels: u32,
    pub channel_targets: Vec<(String, u16)>,
    /// Make `echo $HOME` print nothing.
    pub blank_home: bool,
}

/// A remote machine that outlives individual sessions.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
    sessions_closed: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&mut HostState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn is_running(&self) -> bool {
        self.with_state(|s| s.running)
    }

    pub fn commands(&self) -> Vec<String> {
        self.with_state(|s| s.commands.clone())
    }

    pub fn sessions_closed(&self) -> usize {
        self.sessions_closed.load(Ordering::SeqCst)
    }
}

/// Session against a `FakeHost`; channels are plain TCP to `endpoint`.
pub struct FakeSession {
    host: Arc<FakeHost>,
    endpoint: Option<SocketAddr>,
    closed: AtomicBool,
}

impl FakeSession {
    pub fn new(host: Arc<FakeHost>, endpoint: Option<SocketAddr>) -> Self {
        Self {
            host,
            endpoint,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn run(&self, command: &str) -> CommandOutput {
        self.host.with_state(|state| {
            state.commands.push(command.to_string());

            let mut output = CommandOutput {
                exit_status: Some(0),
                ..Default::default()
            };

            if command.starts_with("pkill -f") {
                if !state.running {
                    output.exit_status = Some(1);
                }
                state.running = false;
            } else if command == "echo $HOME" {
                if !state.blank_home {
                    output.stdout = format!("{}\n", HOME);
                }
            } else if let Some(path) = command.strip_prefix("sha256sum ") {
                let path = unquote_path(path);
                match state.files.get(&path) {
                    Some(file) => {
                        output.stdout =
                            format!("{:x}  {}\n", Sha256::digest(&file.contents), path)
                    }
                    None => output.exit_status = Some(1),
                }
            } else if let Some(path) = command.strip_prefix("chmod 755 ") {
                match state.files.get_mut(&unquote_path(path)) {
                    Some(file) => file.mode = 0o755,
                    None => output.exit_status = Some(1),
                }
            }

            output
        })
    }
}

fn unquote_path(s: &str) -> String {
    s.split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_matches('\'')
        .to_string()
}

impl RemoteSession for FakeSession {
    async fn execute(&self, command: &str) -> Result<CommandOutput> {
        if self.is_closed() {
            return Err(Error::Connection("session closed".into()));
        }
        Ok(self.run(command))
    }

    async fn spawn_detached(&self, command: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Connection("session closed".into()));
        }
        self.host.with_state(|state| {
            state.commands.push(command.to_string());
            state.running = true;
        });
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str, mode: u32) -> Result<()> {
        let contents = tokio::fs::read(local)
            .await
            .map_err(|e| Error::Deployment(e.to_string()))?;
        self.host.with_state(|state| {
            state.uploads += 1;
            state
                .files
                .insert(remote.to_string(), RemoteFile { contents, mode });
        });
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.host.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl ChannelOpener for FakeSession {
    type Stream = TcpStream;

    async fn open_channel(&self, host: &str, port: u16, _peer: SocketAddr) -> Result<TcpStream> {
        let refuse = self.host.with_state(|state| {
            state.channel_targets.push((host.to_string(), port));
            if state.refuse_channels > 0 {
                state.refuse_channels -= 1;
                true
            } else {
                false
            }
        });
        if refuse || self.is_closed() {
            return Err(Error::Channel(format!("{}:{} refused", host, port)));
        }

        let endpoint = self
            .endpoint
            .ok_or_else(|| Error::Channel("no endpoint".into()))?;
        TcpStream::connect(endpoint)
            .await
            .map_err(|e| Error::Channel(format!("{}:{} refused: {}", host, port, e)))
    }
}

/// Hands out `FakeSession`s on one shared host.
pub struct FakeConnector {
    pub host: Arc<FakeHost>,
    pub endpoint: Option<SocketAddr>,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(host: Arc<FakeHost>, endpoint: Option<SocketAddr>) -> Self {
        Self {
            host,
            endpoint,
            connects: AtomicUsize::new(0),
        }
    }
}

impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self) -> Result<FakeSession> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession::new(self.host.clone(), self.endpoint))
    }
}

/// Config for tests: ephemeral port, fast readiness retries, local binary
/// written into `dir`.
pub fn test_config(dir: &Path) -> TunnelConfig {
    let binary = dir.join("siview-server-linux-amd64");
    std::fs::write(&binary, b"\x7fELF fake server").unwrap();

    let mut config = TunnelConfig::default();
    config.deploy.local_binary = binary;
    config.tunnel.local_port = 0;
    config.readiness.max_attempts = 5;
    config.readiness.initial_backoff_ms = 5;
    config.readiness.max_backoff_ms = 20;
    config
}

/// Echoes every byte back until the client closes.
pub async fn spawn_echo_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    (addr, handle)
}

/// Reads each connection to EOF and reports how many bytes arrived.
pub async fn spawn_counting_server() -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                let _ = stream.read_to_end(&mut received).await;
                let _ = tx.send(received);
            });
        }
    });
    (addr, rx)
}

/// Writes `payload` to each connection, then closes it.
pub async fn spawn_sending_server(payload: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let payload = Arc::new(payload);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let payload = payload.clone();
            tokio::spawn(async move {
                let _ = stream.write_all(&payload).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
