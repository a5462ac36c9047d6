//! TOML Configuration File Support
//!
//! Loads a [`TransportConfig`] from `~/.config/dockline/config.toml`, the
//! standard engine environment variables and caller overrides.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. [`ConfigOverrides`] supplied by the caller
//! 2. Environment variables (`DOCKER_HOST`, `DOCKER_API_VERSION`,
//!    `DOCKER_CERT_PATH`, `DOCKLINE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [engine]
//! host = "ssh://deploy@build-01:2222"
//! api_version = "1.45"
//! cert_path = "/home/deploy/.docker/certs"
//!
//! [connection]
//! connect_timeout_ms = 5000
//! max_connections = 16
//!
//! [demux]
//! buffer_size = 32
//!
//! [ssh]
//! accept_any_host_key = false
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::config::TransportConfig;
use crate::transport::descriptor::{HostKeyPolicy, TlsMaterial, TransportDescriptor};
use crate::transport::traits::TransportError;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Engine host or TLS material could not be resolved
    #[error("Invalid engine location: {0}")]
    Engine(#[from] TransportError),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Where the effective configuration last came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    /// Caller overrides
    Overrides,
    /// Environment variables
    Env,
    /// TOML configuration file
    File,
    /// Built-in defaults
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overrides => write!(f, "overrides"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Structures
// =============================================================================

/// `[engine]` section
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineToml {
    /// Engine URL in `DOCKER_HOST` syntax
    pub host: Option<String>,
    /// API version for request URLs
    pub api_version: Option<String>,
    /// Directory holding `ca.pem`, `cert.pem` and `key.pem`
    pub cert_path: Option<PathBuf>,
}

/// `[connection]` section
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionToml {
    /// Connect/handshake deadline in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Channels open at once per agent
    pub max_connections: Option<usize>,
}

/// `[demux]` section
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DemuxToml {
    /// Bounded lead between stdout and stderr, in frames
    pub buffer_size: Option<usize>,
    /// Longest accepted frame payload, in bytes
    pub max_frame_size: Option<usize>,
}

/// `[ssh]` section
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SshToml {
    /// Skip `known_hosts` verification
    pub accept_any_host_key: Option<bool>,
}

/// Root of the configuration file
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DocklineToml {
    /// Engine location
    pub engine: EngineToml,
    /// Connection limits
    pub connection: ConnectionToml,
    /// Demultiplexing
    pub demux: DemuxToml,
    /// SSH tunnel options
    pub ssh: SshToml,
}

// =============================================================================
// Effective Configuration
// =============================================================================

/// Effective configuration after all sources were applied
#[derive(Clone, Debug, Default)]
pub struct DocklineConfig {
    /// Transport settings handed to [`ConnectionAgent::acquire`](crate::ConnectionAgent::acquire)
    pub transport: TransportConfig,

    /// File the configuration was read from, if any
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl DocklineConfig {
    /// Highest-priority source that contributed a value
    pub fn source(&self) -> ConfigSource {
        self.source
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Get the default configuration file path
///
/// `$XDG_CONFIG_HOME/dockline/config.toml`, usually
/// `~/.config/dockline/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("dockline").join("config.toml"))
}

/// Load configuration from the default file and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if an
/// engine location cannot be resolved. A missing file is not an error.
pub fn load_config() -> Result<DocklineConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the result
/// fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<DocklineConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration reading environment variables through `env`
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<DocklineConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = DocklineConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: DocklineToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                engine = %config.transport.descriptor,
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    if config.transport.apply_env(env)? {
        config.source = ConfigSource::Env;
    }

    validate(&config.transport)?;
    Ok(config)
}

fn apply_toml_config(config: &mut DocklineConfig, toml: &DocklineToml) -> Result<(), ConfigError> {
    let transport = &mut config.transport;

    if let Some(ref host) = toml.engine.host {
        transport.descriptor = TransportDescriptor::from_url(host)?;
    }
    if let Some(ref version) = toml.engine.api_version {
        transport.api_version = Some(version.clone());
    }
    if let Some(ref dir) = toml.engine.cert_path {
        let material = TlsMaterial::from_cert_dir(dir)?;
        transport.descriptor = transport.descriptor.clone().with_tls(material);
    }

    if let Some(timeout) = toml.connection.connect_timeout_ms {
        transport.connect_timeout_ms = timeout;
    }
    if let Some(max) = toml.connection.max_connections {
        transport.max_connections = max;
    }
    if let Some(size) = toml.demux.buffer_size {
        transport.demux_buffer_size = size;
    }
    if let Some(size) = toml.demux.max_frame_size {
        transport.demux_max_frame_size = size;
    }

    if toml.ssh.accept_any_host_key == Some(true) {
        if let TransportDescriptor::Ssh {
            ref mut credentials,
            ..
        } = transport.descriptor
        {
            credentials.host_key_policy = HostKeyPolicy::AcceptAny;
        }
    }

    Ok(())
}

fn validate(transport: &TransportConfig) -> Result<(), ConfigError> {
    if transport.max_connections == 0 {
        return Err(ConfigError::ValidationError(
            "max_connections must be at least 1".into(),
        ));
    }
    if transport.demux_buffer_size == 0 {
        return Err(ConfigError::ValidationError(
            "demux buffer_size must be at least 1".into(),
        ));
    }
    if transport.demux_max_frame_size == 0 {
        return Err(ConfigError::ValidationError(
            "demux max_frame_size must be at least 1".into(),
        ));
    }
    if transport.connect_timeout_ms == 0 {
        return Err(ConfigError::ValidationError(
            "connect_timeout_ms must be greater than zero".into(),
        ));
    }
    Ok(())
}

// =============================================================================
// Caller Overrides
// =============================================================================

/// Overrides applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Engine descriptor override
    pub descriptor: Option<TransportDescriptor>,

    /// Connect timeout override (milliseconds)
    pub connect_timeout_ms: Option<u64>,

    /// Demux buffer override
    pub demux_buffer_size: Option<usize>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set descriptor override
    #[must_use]
    pub fn with_descriptor(mut self, descriptor: TransportDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    /// Set connect timeout override
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    /// Set demux buffer override
    #[must_use]
    pub fn with_demux_buffer_size(mut self, size: usize) -> Self {
        self.demux_buffer_size = Some(size);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut DocklineConfig) {
        if self.descriptor.is_some()
            || self.connect_timeout_ms.is_some()
            || self.demux_buffer_size.is_some()
        {
            config.source = ConfigSource::Overrides;
        }

        if let Some(ref descriptor) = self.descriptor {
            config.transport.descriptor = descriptor.clone();
        }
        if let Some(timeout) = self.connect_timeout_ms {
            config.transport.connect_timeout_ms = timeout;
        }
        if let Some(size) = self.demux_buffer_size {
            config.transport.demux_buffer_size = size.max(1);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
