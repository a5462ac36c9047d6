//! Connection Agent
//!
//! An owned handle over one transport resource that mints duplex channels.
//!
//! - Local socket, TCP and TLS agents connect a fresh stream per channel,
//!   bounded by a semaphore of `max_connections`. The permit lives as long as
//!   the channel.
//! - SSH agents hold one authenticated session and open a forwarded channel
//!   per request over it.
//!
//! Release is explicit and consumes the agent. An agent dropped without
//! release still tears its session down in the background.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::config::TransportConfig;
use super::descriptor::TransportDescriptor;
use super::ssh::{RusshConnector, ShellConnector, SshTarget, SshTunnel};
use super::tls::TlsContext;
use super::traits::{BoxedChannel, GuardedChannel, TransportError, TransportKind};

/// How long release waits for outstanding SSH channels to be dropped
pub const RELEASE_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Statistics
// ============================================================================

/// Counters for one agent
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentStats {
    /// Channels opened successfully
    pub channels_opened: u64,
    /// Channel opens that failed
    pub channel_failures: u64,
    /// Channels currently alive
    pub open_channels: usize,
}

#[derive(Default)]
struct AgentStatsAtomic {
    channels_opened: AtomicU64,
    channel_failures: AtomicU64,
    open_channels: AtomicUsize,
}

impl AgentStatsAtomic {
    fn snapshot(&self) -> AgentStats {
        AgentStats {
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channel_failures: self.channel_failures.load(Ordering::Relaxed),
            open_channels: self.open_channels.load(Ordering::Relaxed),
        }
    }
}

/// Holds the pool permit and keeps the open-channel count in step
struct PooledGuard {
    _permit: OwnedSemaphorePermit,
    stats: Arc<AgentStatsAtomic>,
}

impl Drop for PooledGuard {
    fn drop(&mut self) {
        self.stats.open_channels.fetch_sub(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Connection Agent
// ============================================================================

/// Where pooled channels connect to
enum Endpoint {
    #[cfg(unix)]
    LocalSocket { path: PathBuf },
    Tcp { host: String, port: u16 },
    Tls { host: String, port: u16, tls: TlsContext },
}

enum Backend {
    Pooled(Endpoint),
    Ssh { tunnel: Arc<SshTunnel> },
}

/// Owned, releasable handle minting duplex channels to the engine
pub struct ConnectionAgent {
    kind: TransportKind,
    endpoint: String,
    base_url: String,
    backend: Backend,
    limiter: Arc<Semaphore>,
    stats: Arc<AgentStatsAtomic>,
    connect_timeout: Duration,
    released: bool,
}

impl ConnectionAgent {
    /// Acquire an agent for the configured descriptor
    ///
    /// SSH descriptors use the russh client.
    pub async fn acquire(config: &TransportConfig) -> Result<Self, TransportError> {
        let connector = RusshConnector::new(config.connect_timeout());
        Self::acquire_with(config, &connector).await
    }

    /// Acquire an agent, using `connector` for SSH descriptors
    ///
    /// Either a fully usable agent is returned or nothing is left open.
    pub async fn acquire_with(
        config: &TransportConfig,
        connector: &dyn ShellConnector,
    ) -> Result<Self, TransportError> {
        let descriptor = &config.descriptor;
        let kind = descriptor.kind();

        let backend = match descriptor {
            #[cfg(unix)]
            TransportDescriptor::LocalSocket { path } => {
                let meta = tokio::fs::metadata(path).await.map_err(|e| {
                    TransportError::connection(kind, format!("{}: {e}", path.display()))
                })?;
                if meta.is_dir() {
                    return Err(TransportError::connection(
                        kind,
                        format!("{} is a directory", path.display()),
                    ));
                }
                Backend::Pooled(Endpoint::LocalSocket { path: path.clone() })
            }
            #[cfg(not(unix))]
            TransportDescriptor::LocalSocket { .. } => {
                return Err(TransportError::connection(
                    kind,
                    "local sockets are not supported on this platform",
                ));
            }
            TransportDescriptor::Http { host, port, .. } => Backend::Pooled(Endpoint::Tcp {
                host: host.clone(),
                port: *port,
            }),
            TransportDescriptor::Https {
                host, port, tls, ..
            } => Backend::Pooled(Endpoint::Tls {
                host: host.clone(),
                port: *port,
                tls: TlsContext::new(host, tls.as_ref())?,
            }),
            TransportDescriptor::Ssh {
                host,
                port,
                credentials,
                remote_socket_path,
            } => {
                let target = SshTarget {
                    host: host.clone(),
                    port: *port,
                    credentials: credentials.clone(),
                };
                let tunnel = SshTunnel::establish(connector, &target, remote_socket_path).await?;
                Backend::Ssh {
                    tunnel: Arc::new(tunnel),
                }
            }
        };

        let endpoint = descriptor.to_string();
        tracing::info!(transport = %kind, endpoint = %endpoint, "Connection agent acquired");

        Ok(Self {
            kind,
            endpoint,
            base_url: config.base_url(),
            backend,
            limiter: Arc::new(Semaphore::new(config.max_connections.max(1))),
            stats: Arc::new(AgentStatsAtomic::default()),
            connect_timeout: config.connect_timeout(),
            released: false,
        })
    }

    /// Transport this agent uses
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Canonical base URL for requests routed through this agent
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Snapshot of the channel counters
    pub fn stats(&self) -> AgentStats {
        match &self.backend {
            Backend::Ssh { tunnel } => {
                let t = tunnel.stats();
                AgentStats {
                    channels_opened: t.channels_opened,
                    channel_failures: self.stats.channel_failures.load(Ordering::Relaxed),
                    open_channels: t.open_channels,
                }
            }
            Backend::Pooled(_) => self.stats.snapshot(),
        }
    }

    /// Open a new logical duplex channel to the engine
    pub async fn open_channel(&self) -> Result<BoxedChannel, TransportError> {
        let result = match &self.backend {
            Backend::Ssh { tunnel } => tunnel.open_channel().await,
            Backend::Pooled(endpoint) => self.open_pooled(endpoint).await,
        };
        if let Err(e) = &result {
            self.stats.channel_failures.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(transport = %self.kind, error = %e, "Channel open failed");
        }
        result
    }

    async fn open_pooled(&self, endpoint: &Endpoint) -> Result<BoxedChannel, TransportError> {
        let permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Released)?;

        let stream: BoxedChannel = match endpoint {
            #[cfg(unix)]
            Endpoint::LocalSocket { path } => {
                Box::new(self.deadline(tokio::net::UnixStream::connect(path)).await?)
            }
            Endpoint::Tcp { host, port } => {
                let tcp = self.deadline(TcpStream::connect((host.as_str(), *port))).await?;
                let _ = tcp.set_nodelay(true);
                Box::new(tcp)
            }
            Endpoint::Tls { host, port, tls } => {
                let tcp = self.deadline(TcpStream::connect((host.as_str(), *port))).await?;
                let _ = tcp.set_nodelay(true);
                Box::new(self.deadline(tls.handshake(tcp)).await?)
            }
        };

        self.stats.channels_opened.fetch_add(1, Ordering::Relaxed);
        self.stats.open_channels.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(transport = %self.kind, endpoint = %self.endpoint, "Channel opened");

        let guard = PooledGuard {
            _permit: permit,
            stats: Arc::clone(&self.stats),
        };
        Ok(Box::new(GuardedChannel::new(stream, guard)))
    }

    async fn deadline<T>(
        &self,
        io: impl Future<Output = std::io::Result<T>>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(self.connect_timeout, io).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TransportError::connection(
                self.kind,
                format!("{}: {e}", self.endpoint),
            )),
            Err(_) => Err(TransportError::connection(
                self.kind,
                format!(
                    "{}: connect timed out after {} ms",
                    self.endpoint,
                    self.connect_timeout.as_millis()
                ),
            )),
        }
    }

    /// Release the agent and its OS resources
    ///
    /// SSH agents wait (up to [`RELEASE_DRAIN_TIMEOUT`]) for outstanding
    /// channels to be dropped before ending the session.
    pub async fn release(self) -> Result<(), TransportError> {
        self.release_with_timeout(RELEASE_DRAIN_TIMEOUT).await
    }

    /// Release, waiting at most `drain_timeout` for open channels
    pub async fn release_with_timeout(mut self, drain_timeout: Duration) -> Result<(), TransportError> {
        self.released = true;
        self.limiter.close();
        let result = match &self.backend {
            Backend::Ssh { tunnel } => tunnel.close(drain_timeout).await,
            Backend::Pooled(_) => Ok(()),
        };
        tracing::info!(transport = %self.kind, endpoint = %self.endpoint, "Connection agent released");
        result
    }
}

impl Drop for ConnectionAgent {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.limiter.close();
        tracing::warn!(
            transport = %self.kind,
            endpoint = %self.endpoint,
            "Connection agent dropped without release"
        );
        if let Backend::Ssh { tunnel } = &self.backend {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let tunnel = Arc::clone(tunnel);
                runtime.spawn(async move {
                    if let Err(e) = tunnel.close(RELEASE_DRAIN_TIMEOUT).await {
                        tracing::warn!(error = %e, "Background SSH teardown failed");
                    }
                });
            }
        }
    }
}

impl std::fmt::Debug for ConnectionAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAgent")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
