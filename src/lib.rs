//! Remote image viewer tunnel manager.
//!
//! Deploys a viewer server binary to an SSH host, runs it detached, and
//! exposes it on a local loopback port through SSH port forwarding.

mod agent;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod remote;
pub mod ssh;
pub mod ssh_config;
pub mod tunnel;

pub use config::TunnelConfig;
pub use error::{Error, Result};
pub use lifecycle::{Connector, LifecycleCoordinator, SetupStage, SshConnector};
pub use tunnel::{ChannelOpener, RelayStats, TunnelRelay};
