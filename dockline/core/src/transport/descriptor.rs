//! Transport Descriptors
//!
//! How to reach a remote engine. A descriptor is pure data: it never opens a
//! socket by itself, the connection agent does that.
//!
//! Descriptors can be built directly or parsed from a `DOCKER_HOST` style URL:
//!
//! - `unix:///var/run/docker.sock` -> local socket
//! - `ssh://me@example.com:22/var/run/docker.sock` -> SSH forwarded stream
//! - `http://host:2375/prefix` -> plain TCP
//! - `https://host:2376/prefix` -> TLS
//! - `tcp://host:port/prefix` -> TLS on port 2376, plain TCP otherwise

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use super::traits::{TransportError, TransportKind};

/// Default plain TCP engine port
pub const DEFAULT_HTTP_PORT: u16 = 2375;

/// Default TLS engine port
pub const DEFAULT_HTTPS_PORT: u16 = 2376;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// System engine socket on Linux and macOS
pub const SYSTEM_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Placeholder host used in request URLs; routing happens in the agent
pub const PLACEHOLDER_HOST: &str = "0.0.0.0";

/// How the SSH client proves its identity
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SshAuth {
    /// Password authentication
    Password {
        /// The password
        password: String,
    },
    /// Private key read from a file
    KeyFile {
        /// Path to the private key
        path: PathBuf,
        /// Passphrase protecting the key
        passphrase: Option<String>,
    },
    /// Private key given inline in OpenSSH/PEM format
    KeyPem {
        /// Key material
        pem: String,
        /// Passphrase protecting the key
        passphrase: Option<String>,
    },
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { .. } => f.write_str("Password(<redacted>)"),
            Self::KeyFile { path, .. } => f.debug_tuple("KeyFile").field(path).finish(),
            Self::KeyPem { .. } => f.write_str("KeyPem(<redacted>)"),
        }
    }
}

/// Whether the server's host key must match `known_hosts`
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Reject servers whose key is not in the user's `known_hosts`
    #[default]
    KnownHosts,
    /// Accept any host key
    AcceptAny,
}

/// Credentials for an SSH target
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshCredentials {
    /// Remote user
    pub username: String,
    /// Authentication method
    pub auth: SshAuth,
    /// Host key verification
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

/// PEM-encoded TLS material for an HTTPS engine
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsMaterial {
    /// CA bundle to trust; the bundled web PKI roots are used when unset
    pub ca_pem: Option<Vec<u8>>,
    /// Client certificate chain
    pub cert_pem: Option<Vec<u8>>,
    /// Client private key
    pub key_pem: Option<Vec<u8>>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_pem", &self.ca_pem.as_ref().map(Vec::len))
            .field("cert_pem", &self.cert_pem.as_ref().map(Vec::len))
            .field("key_pem", &self.key_pem.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl TlsMaterial {
    /// Load `ca.pem`, `cert.pem` and `key.pem` from a directory
    ///
    /// Missing files are left unset; unreadable files are an error.
    pub fn from_cert_dir(dir: &Path) -> Result<Self, TransportError> {
        let read = |name: &str| -> Result<Option<Vec<u8>>, TransportError> {
            let path = dir.join(name);
            if !path.exists() {
                return Ok(None);
            }
            std::fs::read(&path)
                .map(Some)
                .map_err(|e| TransportError::Tls(format!("failed to read {}: {e}", path.display())))
        };

        Ok(Self {
            ca_pem: read("ca.pem")?,
            cert_pem: read("cert.pem")?,
            key_pem: read("key.pem")?,
        })
    }
}

/// How to reach the remote engine
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportDescriptor {
    /// Local domain socket
    LocalSocket {
        /// Socket path on this machine
        path: PathBuf,
    },
    /// Forwarded local stream over SSH to the engine socket on the remote host
    Ssh {
        /// SSH server host
        host: String,
        /// SSH server port
        port: u16,
        /// Who to log in as and how
        credentials: SshCredentials,
        /// Engine socket path on the remote host
        remote_socket_path: String,
    },
    /// Plain TCP
    Http {
        /// Engine host
        host: String,
        /// Engine port
        port: u16,
        /// Path prefix prepended to every request
        path: Option<String>,
    },
    /// TLS over TCP
    Https {
        /// Engine host, also used for SNI and certificate checks
        host: String,
        /// Engine port
        port: u16,
        /// Path prefix prepended to every request
        path: Option<String>,
        /// Client certificate and trust roots
        tls: Option<TlsMaterial>,
    },
}

impl TransportDescriptor {
    /// Local socket descriptor
    pub fn local_socket(path: impl Into<PathBuf>) -> Self {
        Self::LocalSocket { path: path.into() }
    }

    /// Plain TCP descriptor
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::Http {
            host: host.into(),
            port,
            path: None,
        }
    }

    /// TLS descriptor
    pub fn https(host: impl Into<String>, port: u16, tls: Option<TlsMaterial>) -> Self {
        Self::Https {
            host: host.into(),
            port,
            path: None,
            tls,
        }
    }

    /// SSH descriptor
    pub fn ssh(
        host: impl Into<String>,
        port: u16,
        credentials: SshCredentials,
        remote_socket_path: impl Into<String>,
    ) -> Self {
        Self::Ssh {
            host: host.into(),
            port,
            credentials,
            remote_socket_path: remote_socket_path.into(),
        }
    }

    /// The system-wide engine socket for this platform
    pub fn platform_default() -> Result<Self, TransportError> {
        if cfg!(any(target_os = "linux", target_os = "macos")) {
            Ok(Self::local_socket(SYSTEM_SOCKET_PATH))
        } else {
            Err(TransportError::InvalidDescriptor(format!(
                "no default engine socket for platform {}",
                std::env::consts::OS
            )))
        }
    }

    /// The per-user engine socket (`~/.docker/run/docker.sock`)
    pub fn user_default() -> Result<Self, TransportError> {
        let home = dirs::home_dir().ok_or_else(|| {
            TransportError::InvalidDescriptor("home directory not available".into())
        })?;
        Ok(Self::local_socket(
            home.join(".docker").join("run").join("docker.sock"),
        ))
    }

    /// Parse a `DOCKER_HOST` style URL
    pub fn from_url(raw: &str) -> Result<Self, TransportError> {
        let url = Url::parse(raw)
            .map_err(|e| TransportError::InvalidDescriptor(format!("{raw}: {e}")))?;

        let host = || url.host_str().unwrap_or("127.0.0.1").to_string();
        let path = || match url.path() {
            "" | "/" => None,
            p => Some(p.to_string()),
        };

        match url.scheme() {
            "unix" => {
                if url.path().is_empty() {
                    return Err(TransportError::InvalidDescriptor(format!(
                        "{raw}: missing socket path"
                    )));
                }
                Ok(Self::local_socket(url.path()))
            }
            "ssh" => {
                let username = match url.username() {
                    "" => std::env::var("USER").unwrap_or_else(|_| "root".into()),
                    user => user.to_string(),
                };
                let auth = match url.password() {
                    Some(password) => SshAuth::Password {
                        password: password.to_string(),
                    },
                    None => default_key_auth()?,
                };
                let remote_socket_path = match url.path() {
                    "" | "/" => SYSTEM_SOCKET_PATH.to_string(),
                    p => p.to_string(),
                };
                Ok(Self::Ssh {
                    host: host(),
                    port: url.port().unwrap_or(DEFAULT_SSH_PORT),
                    credentials: SshCredentials {
                        username,
                        auth,
                        host_key_policy: HostKeyPolicy::default(),
                    },
                    remote_socket_path,
                })
            }
            "http" => Ok(Self::Http {
                host: host(),
                port: url.port().unwrap_or(DEFAULT_HTTP_PORT),
                path: path(),
            }),
            "https" => Ok(Self::Https {
                host: host(),
                port: url.port().unwrap_or(DEFAULT_HTTPS_PORT),
                path: path(),
                tls: None,
            }),
            "tcp" => {
                let port = url.port().unwrap_or(DEFAULT_HTTP_PORT);
                if port == DEFAULT_HTTPS_PORT {
                    Ok(Self::Https {
                        host: host(),
                        port,
                        path: path(),
                        tls: None,
                    })
                } else {
                    Ok(Self::Http {
                        host: host(),
                        port,
                        path: path(),
                    })
                }
            }
            other => Err(TransportError::InvalidDescriptor(format!(
                "unsupported protocol {other}:"
            ))),
        }
    }

    /// Attach TLS material to an HTTPS descriptor; other variants are unchanged
    #[must_use]
    pub fn with_tls(self, material: TlsMaterial) -> Self {
        match self {
            Self::Https {
                host, port, path, ..
            } => Self::Https {
                host,
                port,
                path,
                tls: Some(material),
            },
            other => other,
        }
    }

    /// Which transport this descriptor selects
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::LocalSocket { .. } => TransportKind::LocalSocket,
            Self::Ssh { .. } => TransportKind::Ssh,
            Self::Http { .. } => TransportKind::Http,
            Self::Https { .. } => TransportKind::Https,
        }
    }

    /// Base URL for requests issued through an agent built from this descriptor
    ///
    /// The host is always the placeholder `0.0.0.0`: the agent decides where
    /// bytes go. Path prefix and API version are kept.
    #[must_use]
    pub fn request_base_url(&self, api_version: Option<&str>) -> String {
        let version = version_path(api_version);
        match self {
            Self::LocalSocket { .. } | Self::Ssh { .. } => {
                format!("http://{PLACEHOLDER_HOST}{version}")
            }
            Self::Http { path, .. } => format!(
                "http://{PLACEHOLDER_HOST}{}{version}",
                trim_prefix(path.as_deref())
            ),
            Self::Https { path, .. } => format!(
                "https://{PLACEHOLDER_HOST}{}{version}",
                trim_prefix(path.as_deref())
            ),
        }
    }
}

impl fmt::Display for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalSocket { path } => write!(f, "unix://{}", path.display()),
            Self::Ssh {
                host,
                port,
                credentials,
                remote_socket_path,
            } => write!(
                f,
                "ssh://{}@{host}:{port}{remote_socket_path}",
                credentials.username
            ),
            Self::Http { host, port, path } => {
                write!(f, "http://{host}:{port}{}", path.as_deref().unwrap_or(""))
            }
            Self::Https {
                host, port, path, ..
            } => write!(f, "https://{host}:{port}{}", path.as_deref().unwrap_or("")),
        }
    }
}

/// `/v{version}` or nothing
#[must_use]
pub fn version_path(api_version: Option<&str>) -> String {
    match api_version {
        Some(v) if !v.is_empty() => format!("/v{}", v.trim_start_matches('v')),
        _ => String::new(),
    }
}

fn trim_prefix(path: Option<&str>) -> &str {
    path.map_or("", |p| p.trim_end_matches('/'))
}

/// First of the usual OpenSSH identity files that exists
fn default_key_auth() -> Result<SshAuth, TransportError> {
    let ssh_dir = dirs::home_dir()
        .map(|h| h.join(".ssh"))
        .ok_or_else(|| TransportError::InvalidDescriptor("home directory not available".into()))?;

    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|p| p.exists())
        .map(|path| SshAuth::KeyFile {
            path,
            passphrase: None,
        })
        .ok_or_else(|| {
            TransportError::InvalidDescriptor(format!(
                "no password in URL and no identity file in {}",
                ssh_dir.display()
            ))
        })
}
