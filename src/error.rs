//! Error types for the tunnel manager.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::lifecycle::SetupStage;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Host '{alias}' not found in ssh config {}", path.display())]
    HostNotFound { alias: String, path: PathBuf },

    #[error("Failed to read ssh config {}: {source}", path.display())]
    ConfigUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Binary not found: {}. Build it first (e.g. 'make build').", .0.display())]
    LocalBinaryMissing(PathBuf),

    #[error("Deployment failed: {0}")]
    Deployment(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote server did not accept connections after {attempts} attempts")]
    ServerNotReady { attempts: u32 },

    #[error("Remote command '{command}' failed (status {status:?}): {stderr}")]
    RemoteCommand {
        command: String,
        status: Option<u32>,
        stderr: String,
    },

    #[error("Relay I/O error: {0}")]
    Relay(#[from] std::io::Error),

    #[error("{stage} failed: {source}")]
    Setup {
        stage: SetupStage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// True for failures caused by the local ssh configuration rather than
    /// the network or the remote host.
    pub fn is_configuration(&self) -> bool {
        match self {
            Error::HostNotFound { .. } | Error::ConfigUnreadable { .. } => true,
            Error::Setup { source, .. } => source.is_configuration(),
            _ => false,
        }
    }

    /// The stage a setup error occurred in, if any.
    pub fn stage(&self) -> Option<SetupStage> {
        match self {
            Error::Setup { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub(crate) fn in_stage(self, stage: SetupStage) -> Self {
        Error::Setup {
            stage,
            source: Box::new(self),
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Connection(err.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for Error {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        Error::Deployment(err.to_string())
    }
}
