//! Local port forwarding through the SSH session.
//!
//! Listens on a loopback port and, for every accepted connection, opens a
//! channel to one fixed remote endpoint and relays bytes both ways until
//! either side closes.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ReadinessConfig, TunnelSettings};
use crate::error::{Error, Result};

/// Upper bound on closing either side of a finished relay.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Something that can open a byte stream to a remote endpoint.
///
/// Shared by every relay worker, so opening must be safe to call
/// concurrently.
pub trait ChannelOpener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a stream to `host:port`; `peer` is the local client's address,
    /// passed along for remote-side logging.
    fn open_channel(
        &self,
        host: &str,
        port: u16,
        peer: SocketAddr,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// Snapshot of relay statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Connections accepted since start
    pub connections: u64,
    /// Relays currently running
    pub active: u64,
    /// Connections dropped because the channel could not be opened
    pub failed: u64,
    /// Bytes copied local -> remote
    pub bytes_to_remote: u64,
    /// Bytes copied remote -> local
    pub bytes_to_local: u64,
}

#[derive(Default)]
struct RelayCounters {
    connections: AtomicU64,
    active: AtomicU64,
    failed: AtomicU64,
    bytes_to_remote: AtomicU64,
    bytes_to_local: AtomicU64,
}

impl RelayCounters {
    fn snapshot(&self) -> RelayStats {
        RelayStats {
            connections: self.connections.load(Ordering::Relaxed),
            active: self.active.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_to_local: self.bytes_to_local.load(Ordering::Relaxed),
        }
    }
}

/// Counts one running relay; decrements on drop so panics are covered too.
struct ActiveRelay(Arc<RelayCounters>);

impl ActiveRelay {
    fn new(counters: Arc<RelayCounters>) -> Self {
        counters.connections.fetch_add(1, Ordering::Relaxed);
        counters.active.fetch_add(1, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for ActiveRelay {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Where every relayed connection goes.
struct RelayTarget {
    host: String,
    port: u16,
    buffer_size: usize,
}

/// How a relay ended.
#[derive(Debug)]
enum RelayEnd {
    LocalClosed,
    RemoteClosed,
    Shutdown,
    Failed(Error),
}

/// A running local listener forwarding to one remote endpoint.
pub struct TunnelRelay {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    counters: Arc<RelayCounters>,
}

impl TunnelRelay {
    /// Bind `127.0.0.1:<local_port>` and start accepting.
    pub fn start<O: ChannelOpener>(opener: Arc<O>, settings: &TunnelSettings) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, settings.local_port));
        let listener = bind_loopback(addr)?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;

        info!(
            "Tunnel listening on {} -> {}:{}",
            local_addr, settings.remote_host, settings.remote_port
        );

        let cancel = CancellationToken::new();
        let counters = Arc::new(RelayCounters::default());
        let target = Arc::new(RelayTarget {
            host: settings.remote_host.clone(),
            port: settings.remote_port,
            buffer_size: settings.buffer_size.max(1),
        });

        let accept_task = tokio::spawn(accept_loop(
            listener,
            opener,
            target,
            cancel.clone(),
            counters.clone(),
        ));

        Ok(Self {
            local_addr,
            cancel,
            accept_task: Some(accept_task),
            counters,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.accept_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop accepting, tear down every relay, and wait until the listener is
    /// closed and all workers have exited. Later calls are no-ops.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                warn!("Tunnel accept task failed: {}", e);
            }
            info!("Tunnel on {} shut down", self.local_addr);
        }
    }
}

impl Drop for TunnelRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn bind_loopback(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |source: io::Error| {
        match source.kind() {
            io::ErrorKind::AddrInUse => {
                warn!("{} is already in use; is another viewer running?", addr)
            }
            io::ErrorKind::PermissionDenied => {
                warn!("Permission denied binding {}; ports below 1024 need privileges", addr)
            }
            _ => {}
        }
        Error::Bind { addr, source }
    };

    let socket = TcpSocket::new_v4().map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(1024).map_err(bind_err)
}

async fn accept_loop<O: ChannelOpener>(
    listener: TcpListener,
    opener: Arc<O>,
    target: Arc<RelayTarget>,
    cancel: CancellationToken,
    counters: Arc<RelayCounters>,
) {
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    let active = ActiveRelay::new(counters.clone());
                    workers.spawn(relay_connection(
                        stream,
                        peer,
                        opener.clone(),
                        target.clone(),
                        cancel.clone(),
                        active,
                    ));
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },

            Some(finished) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = finished {
                    warn!("Relay worker failed: {}", e);
                }
            }
        }
    }

    drop(listener);
    debug!("Listener closed, waiting for {} relay(s)", workers.len());

    while let Some(finished) = workers.join_next().await {
        if let Err(e) = finished {
            warn!("Relay worker failed: {}", e);
        }
    }
}

/// One connection: open the channel, relay, close both sides.
async fn relay_connection<O: ChannelOpener>(
    mut local: TcpStream,
    peer: SocketAddr,
    opener: Arc<O>,
    target: Arc<RelayTarget>,
    cancel: CancellationToken,
    active: ActiveRelay,
) {
    debug!("Accepted {}, opening channel to {}:{}", peer, target.host, target.port);

    let opened = tokio::select! {
        _ = cancel.cancelled() => None,
        result = opener.open_channel(&target.host, target.port, peer) => Some(result),
    };

    let mut channel = match opened {
        Some(Ok(channel)) => channel,
        Some(Err(e)) => {
            warn!("Dropping connection from {}: {}", peer, e);
            active.0.failed.fetch_add(1, Ordering::Relaxed);
            close_quietly(&mut local).await;
            return;
        }
        None => {
            close_quietly(&mut local).await;
            return;
        }
    };

    let end = relay(
        &mut local,
        &mut channel,
        target.buffer_size,
        &cancel,
        &active.0,
    )
    .await;

    match end {
        RelayEnd::LocalClosed => debug!("{} closed the connection", peer),
        RelayEnd::RemoteClosed => debug!("Remote closed the channel for {}", peer),
        RelayEnd::Shutdown => debug!("Relay for {} stopped by shutdown", peer),
        RelayEnd::Failed(e) => debug!("Relay for {} ended: {}", peer, e),
    }

    close_quietly(&mut channel).await;
    close_quietly(&mut local).await;
}

async fn close_quietly<S: AsyncWrite + Unpin>(stream: &mut S) {
    let _ = tokio::time::timeout(CLOSE_GRACE, stream.shutdown()).await;
}

/// Copy both directions until the first end-of-stream, error, or shutdown.
async fn relay<L, R>(
    local: &mut L,
    remote: &mut R,
    buffer_size: usize,
    cancel: &CancellationToken,
    counters: &RelayCounters,
) -> RelayEnd
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);

    tokio::select! {
        _ = cancel.cancelled() => RelayEnd::Shutdown,
        result = pump(&mut local_rd, &mut remote_wr, buffer_size, &counters.bytes_to_remote) => {
            match result {
                Ok(_) => RelayEnd::LocalClosed,
                Err(e) => RelayEnd::Failed(Error::Relay(e)),
            }
        }
        result = pump(&mut remote_rd, &mut local_wr, buffer_size, &counters.bytes_to_local) => {
            match result {
                Ok(_) => RelayEnd::RemoteClosed,
                Err(e) => RelayEnd::Failed(Error::Relay(e)),
            }
        }
    }
}

/// Read a chunk, write all of it, repeat. Returns bytes copied at EOF.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    counter: &AtomicU64,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Poll the remote endpoint with short-lived channels until one opens.
///
/// A freshly launched server gives no readiness signal of its own.
pub async fn wait_until_ready<O: ChannelOpener>(
    opener: &O,
    host: &str,
    port: u16,
    policy: &ReadinessConfig,
) -> Result<()> {
    let probe_peer = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..=attempts {
        match opener.open_channel(host, port, probe_peer).await {
            Ok(mut stream) => {
                close_quietly(&mut stream).await;
                debug!("{}:{} accepted a probe after {} attempt(s)", host, port, attempt);
                return Ok(());
            }
            Err(e) => {
                debug!("Probe {}/{} to {}:{} failed: {}", attempt, attempts, host, port, e);
                if attempt < attempts {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
        }
    }

    Err(Error::ServerNotReady { attempts })
}
