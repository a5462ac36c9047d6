//! russh-backed remote-shell client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Handler};
use russh::keys::{self, ssh_key, PrivateKeyWithHashAlg};
use russh::Disconnect;

use super::{ForwardError, ShellConnector, ShellSession, SshTarget};
use crate::transport::descriptor::{HostKeyPolicy, SshAuth, SshCredentials};
use crate::transport::traits::{BoxedChannel, TransportError, TransportKind};

/// Interval between SSH keepalive requests
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Connects to OpenSSH-compatible servers with russh
pub struct RusshConnector {
    config: Arc<client::Config>,
    connect_timeout: Duration,
}

impl RusshConnector {
    /// Create a connector with a connect+authenticate deadline
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        let config = client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            connect_timeout,
        }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Client handler verifying the server host key
struct HostKeyCheck {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAny => Ok(true),
            HostKeyPolicy::KnownHosts => {
                match keys::check_known_hosts(&self.host, self.port, server_public_key) {
                    Ok(known) => {
                        if !known {
                            tracing::warn!(host = %self.host, "Host key not in known_hosts");
                        }
                        Ok(known)
                    }
                    Err(e) => {
                        tracing::warn!(host = %self.host, error = %e, "Host key verification failed");
                        Ok(false)
                    }
                }
            }
        }
    }
}

async fn authenticate(
    handle: &mut Handle<HostKeyCheck>,
    credentials: &SshCredentials,
) -> Result<(), TransportError> {
    let auth_error = |e: &dyn std::fmt::Display| TransportError::connection(TransportKind::Ssh, e);
    let user = credentials.username.as_str();

    let key = match &credentials.auth {
        SshAuth::Password { password } => {
            let result = handle
                .authenticate_password(user, password.as_str())
                .await
                .map_err(|e| auth_error(&e))?;
            return if result.success() {
                Ok(())
            } else {
                Err(auth_error(&format!("password rejected for {user}")))
            };
        }
        SshAuth::KeyFile { path, passphrase } => {
            keys::load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                auth_error(&format!("failed to load key {}: {e}", path.display()))
            })?
        }
        SshAuth::KeyPem { pem, passphrase } => keys::decode_secret_key(pem, passphrase.as_deref())
            .map_err(|e| auth_error(&format!("failed to decode key: {e}")))?,
    };

    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .map_err(|e| auth_error(&e))?
        .flatten();
    let result = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await
        .map_err(|e| auth_error(&e))?;

    if result.success() {
        Ok(())
    } else {
        Err(auth_error(&format!("public key rejected for {user}")))
    }
}

#[async_trait]
impl ShellConnector for RusshConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Arc<dyn ShellSession>, TransportError> {
        let handler = HostKeyCheck {
            host: target.host.clone(),
            port: target.port,
            policy: target.credentials.host_key_policy,
        };

        let establish = async {
            let mut handle = client::connect(
                Arc::clone(&self.config),
                (target.host.as_str(), target.port),
                handler,
            )
            .await
            .map_err(|e| TransportError::connection(TransportKind::Ssh, e))?;
            authenticate(&mut handle, &target.credentials).await?;
            Ok::<_, TransportError>(handle)
        };

        let handle = tokio::time::timeout(self.connect_timeout, establish)
            .await
            .map_err(|_| {
                TransportError::connection(
                    TransportKind::Ssh,
                    format!(
                        "{}:{}: connect timed out after {} ms",
                        target.host,
                        target.port,
                        self.connect_timeout.as_millis()
                    ),
                )
            })??;

        Ok(Arc::new(RusshSession { handle }))
    }
}

/// One authenticated russh session
struct RusshSession {
    handle: Handle<HostKeyCheck>,
}

#[async_trait]
impl ShellSession for RusshSession {
    async fn open_forwarded_local_stream(
        &self,
        socket_path: &str,
    ) -> Result<BoxedChannel, ForwardError> {
        match self.handle.channel_open_direct_streamlocal(socket_path).await {
            Ok(channel) => Ok(Box::new(Box::pin(channel.into_stream()))),
            Err(e) if self.handle.is_closed() => Err(ForwardError::Session(e.to_string())),
            Err(e) => Err(ForwardError::Channel(e.to_string())),
        }
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn end(&self) -> Result<(), TransportError> {
        if self.handle.is_closed() {
            return Ok(());
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| TransportError::Session(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_silent_server_times_out_as_connection_error() {
        // Never sends an SSH banner
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = SshTarget {
            host: "127.0.0.1".into(),
            port,
            credentials: SshCredentials {
                username: "me".into(),
                auth: SshAuth::Password {
                    password: "pw".into(),
                },
                host_key_policy: HostKeyPolicy::AcceptAny,
            },
        };
        let connector = RusshConnector::new(Duration::from_millis(100));

        match connector.connect(&target).await {
            Err(TransportError::Connection { transport, cause }) => {
                assert_eq!(transport, TransportKind::Ssh);
                assert!(cause.contains("timed out after 100 ms"), "{cause}");
            }
            Err(other) => panic!("expected connection error, got {other}"),
            Ok(_) => panic!("connect to a silent server succeeded"),
        }
        drop(listener);
    }
}
