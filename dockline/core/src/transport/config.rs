//! Transport Configuration
//!
//! Where the engine lives and how connections to it are bounded.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::descriptor::{TlsMaterial, TransportDescriptor, SYSTEM_SOCKET_PATH};
use crate::demux::{DemuxOptions, MAX_FRAME_SIZE};
use super::traits::TransportError;

/// Default number of frames the faster output may run ahead of the slower one
pub const DEFAULT_DEMUX_BUFFER_SIZE: usize = 16;

/// Default connect/handshake deadline in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default limit of simultaneously open channels per agent
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Transport configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    /// Which engine to connect to
    pub descriptor: TransportDescriptor,

    /// Engine API version appended to the request base URL (e.g. "1.45")
    pub api_version: Option<String>,

    /// Connection timeout in milliseconds
    ///
    /// Covers TCP connect, TLS handshake and SSH connect+authenticate.
    pub connect_timeout_ms: u64,

    /// Maximum channels open at once on a pooling agent
    ///
    /// Further `open_channel` calls wait for a channel to be dropped.
    pub max_connections: usize,

    /// Bounded lead between stdout and stderr, in frames
    pub demux_buffer_size: usize,

    /// Longest frame payload the demultiplexer accepts, in bytes
    pub demux_max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            descriptor: TransportDescriptor::local_socket(SYSTEM_SOCKET_PATH),
            api_version: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            demux_buffer_size: DEFAULT_DEMUX_BUFFER_SIZE,
            demux_max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    /// Configuration for an explicit descriptor with default limits
    pub fn for_descriptor(descriptor: TransportDescriptor) -> Self {
        Self {
            descriptor,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `DOCKER_HOST`: engine URL (default `unix:///var/run/docker.sock`)
    /// - `DOCKER_API_VERSION`: API version for the base URL
    /// - `DOCKER_CERT_PATH`: directory with `ca.pem`, `cert.pem`, `key.pem`
    /// - `DOCKLINE_CONNECT_TIMEOUT`: connection timeout in ms
    /// - `DOCKLINE_MAX_CONNECTIONS`: maximum open channels per agent
    /// - `DOCKLINE_DEMUX_BUFFER`: bounded lead in frames
    /// - `DOCKLINE_DEMUX_MAX_FRAME`: largest accepted frame payload in bytes
    pub fn from_env() -> Result<Self, TransportError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`
    ///
    /// Empty and unparsable values are ignored. Returns whether any value
    /// was applied.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<bool, TransportError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let mut applied = false;

        if let Some(url) = var("DOCKER_HOST") {
            self.descriptor = TransportDescriptor::from_url(&url)?;
            applied = true;
        }
        if let Some(version) = var("DOCKER_API_VERSION") {
            self.api_version = Some(version);
            applied = true;
        }
        if let Some(dir) = var("DOCKER_CERT_PATH") {
            let material = TlsMaterial::from_cert_dir(&PathBuf::from(dir))?;
            self.descriptor = std::mem::replace(
                &mut self.descriptor,
                TransportDescriptor::local_socket(SYSTEM_SOCKET_PATH),
            )
            .with_tls(material);
            applied = true;
        }
        if let Some(ms) = var("DOCKLINE_CONNECT_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.connect_timeout_ms = ms;
            applied = true;
        }
        if let Some(n) = var("DOCKLINE_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
        {
            self.max_connections = n;
            applied = true;
        }
        if let Some(n) = var("DOCKLINE_DEMUX_BUFFER")
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
        {
            self.demux_buffer_size = n;
            applied = true;
        }
        if let Some(n) = var("DOCKLINE_DEMUX_MAX_FRAME")
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
        {
            self.demux_max_frame_size = n;
            applied = true;
        }

        Ok(applied)
    }

    /// Demultiplexing options carrying the configured limits
    #[must_use]
    pub fn demux_options(&self) -> DemuxOptions {
        DemuxOptions {
            buffer_size: self.demux_buffer_size,
            max_frame_size: self.demux_max_frame_size,
            ..DemuxOptions::default()
        }
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check if this configuration targets a local socket
    pub fn is_local_socket(&self) -> bool {
        matches!(self.descriptor, TransportDescriptor::LocalSocket { .. })
    }

    /// Check if this configuration targets an SSH host
    pub fn is_ssh(&self) -> bool {
        matches!(self.descriptor, TransportDescriptor::Ssh { .. })
    }

    /// Request base URL for this configuration
    pub fn base_url(&self) -> String {
        self.descriptor
            .request_base_url(self.api_version.as_deref())
    }
}
