//! Dockline Core - Hijacked Connections to Container Engines
//!
//! This crate opens bidirectional byte streams to a container engine over a
//! local socket, TCP, TLS or an SSH tunnel, hijacks an attach/exec request
//! on them, and splits the engine's multiplexed output back into separate
//! stdout and stderr streams while forwarding stdin.
//!
//! It does not build API requests beyond the upgrade handshake. Callers
//! bring their own request bodies and decide what to do with the output.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Caller                                 │
//! │           attach / exec request      stdout  stderr  stdin        │
//! └──────────────┬───────────────────────────▲───────▲───────┬────────┘
//!                │                           │       │       │
//! ┌──────────────┼───────────────────────────┼───────┼───────┼────────┐
//! │              ▼                  DEMUX    │       │       │        │
//! │   ┌────────────────────┐      ┌──────────┴───────┴──┐    │        │
//! │   │      HIJACK        │      │     Partitioner     │    │        │
//! │   │ UpgradeRequest ──▶ │      │  (bounded lead)     │    │        │
//! │   │ ResponseMetadata   │      └──────────▲──────────┘    │        │
//! │   │  classify() ───────┼──▶ StreamSocket │               │        │
//! │   └─────────▲──────────┘       FrameDecoder / raw        │        │
//! │             │                            ▲               │        │
//! │   ┌─────────┴────────────────────────────┴───────────────▼─────┐  │
//! │   │                        TRANSPORT                           │  │
//! │   │  TransportDescriptor ─▶ ConnectionAgent ─▶ DuplexChannel   │  │
//! │   │  local socket │ tcp │ tls (rustls) │ ssh tunnel (russh)    │  │
//! │   └────────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use dockline_core::{
//!     demux, hijack_stream, ConnectionAgent, DemuxOptions, TransportConfig, UpgradeRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TransportConfig::from_env()?;
//!     let agent = ConnectionAgent::acquire(&config).await?;
//!
//!     let channel = agent.open_channel().await?;
//!     let request = UpgradeRequest::post("/v1.45/containers/web/attach?stream=1&stdout=1&stderr=1");
//!     let (_meta, socket) = hijack_stream(channel, &request).await?;
//!
//!     let outcome = demux(
//!         socket,
//!         tokio::io::empty(),
//!         &mut tokio::io::stdout(),
//!         &mut tokio::io::stderr(),
//!         DemuxOptions::default(),
//!     )
//!     .await;
//!     outcome.into_result()?;
//!
//!     agent.release().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`transport`]: descriptors, connection agents, TLS and SSH tunnels
//! - [`hijack`]: upgrade handshake and stream classification
//! - [`demux`]: frame codec, partitioning, stdin forwarding and raw stdio packing
//! - [`config`]: TOML and environment configuration loading

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod demux;
pub mod hijack;
pub mod transport;

// Transport exports
pub use transport::{
    acquire_connection, with_connection, AgentStats, BoxedChannel, ConnectionAgent,
    DuplexChannel, HostKeyPolicy, RusshConnector, ShellConnector, ShellSession, SshAuth,
    SshCredentials, SshTunnel, TlsMaterial, TransportConfig, TransportDescriptor, TransportError,
    TransportKind,
};

// Hijack exports
pub use hijack::{
    classify, hijack, hijack_stream, ClassifyError, HijackError, ResponseMetadata, StreamKind,
    StreamSocket, UpgradeRequest, UpgradedChannel,
};

// Demux exports
pub use demux::{
    demux, demux_raw_stdio, demux_raw_stdio_to_single_sink, demux_to_single_sink, encode_frame,
    merge_tagged, pack, split, split_tagged, DecodeError, DemuxError, DemuxOptions, DemuxOutcome,
    DemuxStreams, Frame, FrameDecoder, PackedSocket, RawStdio, StreamChannel, TaggedStream,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, DocklineConfig,
};
