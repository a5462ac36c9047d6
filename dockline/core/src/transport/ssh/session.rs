//! SSH tunnel channel factory
//!
//! Owns one ready session and mints forwarded channels over it. Tracks how
//! many channels are still alive so teardown can wait for their owners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::{ForwardError, ShellConnector, ShellSession, SshTarget};
use crate::transport::traits::{BoxedChannel, GuardedChannel, TransportError};

/// Lifecycle of a tunnel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelState {
    /// Session authenticated, channels can be opened
    Ready,
    /// Session failed; every open fails with this message
    Failed(String),
    /// Tunnel was closed by its owner
    Closed,
}

/// Counters for one tunnel
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Forwarded channels opened successfully
    pub channels_opened: u64,
    /// Channel opens that failed without affecting the session
    pub channel_failures: u64,
    /// Channels currently alive
    pub open_channels: usize,
}

/// Channel factory over a single authenticated SSH session
pub struct SshTunnel {
    label: String,
    remote_socket_path: String,
    session: Arc<dyn ShellSession>,
    state: watch::Sender<TunnelState>,
    open_channels: Arc<watch::Sender<usize>>,
    channels_opened: AtomicU64,
    channel_failures: AtomicU64,
}

/// Decrements the open-channel count when the channel is dropped
struct ChannelGuard {
    open_channels: Arc<watch::Sender<usize>>,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.open_channels.send_modify(|n| *n = n.saturating_sub(1));
        tracing::debug!("Forwarded channel closed");
    }
}

impl SshTunnel {
    /// Connect and authenticate, returning once the session is ready
    pub async fn establish(
        connector: &dyn ShellConnector,
        target: &SshTarget,
        remote_socket_path: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let label = format!(
            "{}@{}:{}",
            target.credentials.username, target.host, target.port
        );
        let session = connector.connect(target).await?;
        tracing::info!(host = %label, "SSH session ready");
        Ok(Self::from_session(label, session, remote_socket_path))
    }

    /// Wrap an already ready session
    pub fn from_session(
        label: impl Into<String>,
        session: Arc<dyn ShellSession>,
        remote_socket_path: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(TunnelState::Ready);
        let (open_channels, _) = watch::channel(0usize);
        Self {
            label: label.into(),
            remote_socket_path: remote_socket_path.into(),
            session,
            state,
            open_channels: Arc::new(open_channels),
            channels_opened: AtomicU64::new(0),
            channel_failures: AtomicU64::new(0),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// Remote engine socket every channel forwards to
    #[must_use]
    pub fn remote_socket_path(&self) -> &str {
        &self.remote_socket_path
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn stats(&self) -> TunnelStats {
        TunnelStats {
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channel_failures: self.channel_failures.load(Ordering::Relaxed),
            open_channels: *self.open_channels.borrow(),
        }
    }

    fn check_usable(&self) -> Result<(), TransportError> {
        match &*self.state.borrow() {
            TunnelState::Ready => Ok(()),
            TunnelState::Failed(reason) => Err(TransportError::Session(reason.clone())),
            TunnelState::Closed => Err(TransportError::Released),
        }
    }

    fn fail(&self, reason: &str) -> TransportError {
        self.state.send_if_modified(|state| {
            if *state == TunnelState::Ready {
                *state = TunnelState::Failed(reason.to_string());
                true
            } else {
                false
            }
        });
        tracing::warn!(host = %self.label, error = %reason, "SSH session failed");
        TransportError::Session(reason.to_string())
    }

    /// Open a new forwarded channel to the remote engine socket
    ///
    /// A channel-level failure leaves the session usable. A session failure
    /// is reported to this caller, to every other caller currently waiting
    /// here, and to every later caller.
    pub async fn open_channel(&self) -> Result<BoxedChannel, TransportError> {
        self.check_usable()?;

        if self.session.is_closed() {
            return Err(self.fail("session closed by peer"));
        }

        let mut state_rx = self.state.subscribe();
        let opened = tokio::select! {
            result = self.session.open_forwarded_local_stream(&self.remote_socket_path) => result,
            changed = state_rx.wait_for(|s| *s != TunnelState::Ready) => {
                let reason = match changed.as_deref() {
                    Ok(TunnelState::Failed(reason)) => reason.clone(),
                    _ => "tunnel closed while opening channel".to_string(),
                };
                return Err(TransportError::Session(reason));
            }
        };

        match opened {
            Ok(stream) => {
                self.open_channels.send_modify(|n| *n += 1);
                self.channels_opened.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    host = %self.label,
                    socket = %self.remote_socket_path,
                    "Forwarded channel opened"
                );
                let guard = ChannelGuard {
                    open_channels: Arc::clone(&self.open_channels),
                };
                Ok(Box::new(GuardedChannel::new(stream, guard)))
            }
            Err(ForwardError::Channel(reason)) => {
                self.channel_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(host = %self.label, error = %reason, "Channel open failed");
                Err(TransportError::Channel(reason))
            }
            Err(ForwardError::Session(reason)) => Err(self.fail(&reason)),
        }
    }

    /// Wait for every channel to be dropped, then end the session
    ///
    /// Channels still open after `drain_timeout` are cut off by ending the
    /// session anyway.
    pub async fn close(&self, drain_timeout: Duration) -> Result<(), TransportError> {
        self.state.send_if_modified(|state| {
            if *state == TunnelState::Ready {
                *state = TunnelState::Closed;
                true
            } else {
                false
            }
        });

        let mut open_rx = self.open_channels.subscribe();
        if tokio::time::timeout(drain_timeout, open_rx.wait_for(|n| *n == 0))
            .await
            .is_err()
        {
            tracing::warn!(
                host = %self.label,
                open_channels = *self.open_channels.borrow(),
                "Ending SSH session with channels still open"
            );
        }

        let result = self.session.end().await;
        tracing::info!(host = %self.label, "SSH session ended");
        result
    }
}

impl std::fmt::Debug for SshTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTunnel")
            .field("target", &self.label)
            .field("remote_socket_path", &self.remote_socket_path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
