//! SSH Tunnel Transport
//!
//! Reaches an engine socket on a remote host through one authenticated SSH
//! session. Every logical connection is a separate forwarded-local-stream
//! channel (the OpenSSH `direct-streamlocal@openssh.com` extension), so many
//! hijacked requests can share the session concurrently.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐  open_channel()   ┌────────────────────┐
//! │ ConnectionAgent├──────────────────►│     SshTunnel      │
//! └────────────────┘                   │  state: Ready      │
//!                                      │  open channels: N  │
//!                                      └─────────┬──────────┘
//!                                                │ ShellSession
//!                                   ┌────────────┴─────────────┐
//!                                   │  one authenticated SSH   │
//!                                   │  session (russh)         │
//!                                   └──┬─────────┬─────────┬───┘
//!                                      │ ch 1    │ ch 2    │ ch 3
//!                                      ▼         ▼         ▼
//!                                  remote engine socket (unix)
//! ```
//!
//! The remote-shell client is behind [`ShellConnector`] / [`ShellSession`] so
//! the tunnel state machine can run against any implementation.

mod client;
mod session;

pub use client::RusshConnector;
pub use session::{SshTunnel, TunnelState, TunnelStats};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::descriptor::SshCredentials;
use super::traits::{BoxedChannel, TransportError};

/// Where to connect and as whom
#[derive(Clone, Debug)]
pub struct SshTarget {
    /// SSH server host
    pub host: String,
    /// SSH server port
    pub port: u16,
    /// Login credentials
    pub credentials: SshCredentials,
}

/// Failure to open a forwarded stream
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Only this channel failed (e.g. the remote socket does not exist)
    #[error("{0}")]
    Channel(String),
    /// The session itself is gone
    #[error("{0}")]
    Session(String),
}

/// A remote-shell client able to establish authenticated sessions
#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Connect, authenticate and wait until the session is ready
    ///
    /// Any failure before the session is ready is returned here.
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn ShellSession>, TransportError>;
}

/// An authenticated session able to open forwarded channels
#[async_trait]
pub trait ShellSession: Send + Sync {
    /// Open a new forwarded-local-stream channel to `socket_path` on the server
    async fn open_forwarded_local_stream(
        &self,
        socket_path: &str,
    ) -> Result<BoxedChannel, ForwardError>;

    /// Whether the session has been closed by either side
    fn is_closed(&self) -> bool;

    /// End the session
    async fn end(&self) -> Result<(), TransportError>;
}
