//! TLS Client Context
//!
//! Builds the rustls client configuration for HTTPS engines from PEM
//! material. The context is created once per agent and shared by every
//! channel it opens.

use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::descriptor::TlsMaterial;
use super::traits::TransportError;

/// Client-side TLS context bound to one engine host
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    /// Build a context for `host`
    ///
    /// Trust roots come from `ca_pem` when it is set, otherwise from the
    /// bundled web PKI roots. A client certificate is used when both
    /// certificate and key are set.
    pub fn new(host: &str, material: Option<&TlsMaterial>) -> Result<Self, TransportError> {
        let default_material = TlsMaterial::default();
        let material = material.unwrap_or(&default_material);

        let root_store = match material.ca_pem.as_deref() {
            Some(ca_pem) => {
                let ca_certs = parse_certificates(ca_pem)?;
                if ca_certs.is_empty() {
                    return Err(TransportError::Tls("no CA certificates found".into()));
                }
                let mut store = RootCertStore::empty();
                for cert in ca_certs {
                    store.add(cert).map_err(|e| {
                        TransportError::Tls(format!("failed to add CA certificate: {e}"))
                    })?;
                }
                store
            }
            None => {
                let mut store = RootCertStore::empty();
                store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                store
            }
        };

        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(format!("protocol configuration error: {e}")))?
        .with_root_certificates(root_store);

        let config = match (material.cert_pem.as_deref(), material.key_pem.as_deref()) {
            (Some(cert_pem), Some(key_pem)) => {
                let chain = parse_certificates(cert_pem)?;
                if chain.is_empty() {
                    return Err(TransportError::Tls("no client certificates found".into()));
                }
                let key = parse_private_key(key_pem)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| TransportError::Tls(format!("client config error: {e}")))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(TransportError::Tls(
                    "client certificate and key must be given together".into(),
                ))
            }
        };

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| TransportError::Tls(format!("invalid server name {host}: {e}")))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    /// Run the client handshake over an established TCP stream
    pub async fn handshake(&self, tcp: TcpStream) -> std::io::Result<TlsStream<TcpStream>> {
        self.connector
            .connect(self.server_name.clone(), tcp)
            .await
    }
}

/// Parse PEM-encoded certificates.
fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("failed to parse certificates: {e}")))
}

/// Parse a PEM-encoded private key.
fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TransportError> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| TransportError::Tls(format!("failed to parse private key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_material_uses_web_roots() {
        let context = TlsContext::new("engine.example.com", None).unwrap();
        assert_eq!(
            context.server_name,
            ServerName::try_from("engine.example.com").unwrap()
        );
    }

    #[test]
    fn test_missing_ca_uses_web_roots() {
        let material = TlsMaterial::default();
        assert!(TlsContext::new("engine.local", Some(&material)).is_ok());
    }

    #[test]
    fn test_half_client_identity_is_rejected() {
        let material = TlsMaterial {
            cert_pem: Some(b"cert".to_vec()),
            ..Default::default()
        };
        let result = TlsContext::new("engine.local", Some(&material));
        assert!(matches!(result, Err(TransportError::Tls(msg)) if msg.contains("together")));
    }

    #[test]
    fn test_garbage_ca_is_rejected() {
        let material = TlsMaterial {
            ca_pem: Some(b"not a certificate".to_vec()),
            ..Default::default()
        };
        let result = TlsContext::new("engine.local", Some(&material));
        assert!(matches!(result, Err(TransportError::Tls(_))));
    }
}
