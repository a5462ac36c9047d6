//! Transport Layer for Engine Connections
//!
//! Opens raw bidirectional byte streams to a remote engine:
//! - `LocalSocket`: Unix domain socket on this machine
//! - `Http`: plain TCP
//! - `Https`: TLS over TCP with caller-supplied PEM material
//! - `Ssh`: forwarded local stream over one shared SSH session
//!
//! # Design Philosophy
//!
//! A [`TransportDescriptor`] says where the engine is. A [`ConnectionAgent`]
//! acquired from it owns the OS resource and mints [`DuplexChannel`]s that
//! an HTTP layer can write a request onto and later hijack.
//!
//! # Resource handling
//!
//! - Acquisition either fully succeeds or leaves nothing open
//! - Every channel carries its pool permit; dropping the channel returns it
//! - `release` consumes the agent, so it cannot be used afterwards

pub mod agent;
pub mod config;
pub mod descriptor;
pub mod factory;
pub mod ssh;
pub mod tls;
pub mod traits;

// Re-exports for convenience
pub use agent::{AgentStats, ConnectionAgent, RELEASE_DRAIN_TIMEOUT};
pub use config::{TransportConfig, DEFAULT_DEMUX_BUFFER_SIZE};
pub use descriptor::{
    version_path, HostKeyPolicy, SshAuth, SshCredentials, TlsMaterial, TransportDescriptor,
};
pub use factory::{acquire_connection, with_connection};
pub use ssh::{
    ForwardError, RusshConnector, ShellConnector, ShellSession, SshTarget, SshTunnel, TunnelState,
    TunnelStats,
};
pub use tls::TlsContext;
pub use traits::{BoxedChannel, DuplexChannel, GuardedChannel, TransportError, TransportKind};
