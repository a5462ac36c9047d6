//! Transport integration tests
//!
//! Each test acquires a real agent, hijacks a request through it and
//! demultiplexes the answer of a scripted engine:
//! - local socket
//! - SSH tunnel over an in-memory session
//! - TLS with a throwaway CA
//! - configuration file driving acquisition

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::net::TcpListener;

use common::{init_tracing, serve_hijack, EngineScript, MockConnector, MockSession};
use dockline_core::config::load_config_with_env;
use dockline_core::{
    demux, hijack_stream, ConnectionAgent, DemuxOptions, HijackError, HostKeyPolicy,
    StreamChannel, StreamKind, SshAuth, SshCredentials, TlsMaterial, TransportConfig,
    TransportDescriptor, TransportError, TransportKind, UpgradeRequest,
};

const ATTACH: &str = "/v1.45/containers/web/attach?stream=1&stdin=1&stdout=1&stderr=1";

/// Hijack one channel of `agent` and collect (stdout, stderr)
async fn attach(agent: &ConnectionAgent, stdin: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let channel = agent.open_channel().await.unwrap();
    let (_meta, socket) = hijack_stream(channel, &UpgradeRequest::post(ATTACH))
        .await
        .unwrap();

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    demux(socket, stdin, &mut stdout, &mut stderr, DemuxOptions::default())
        .await
        .into_result()
        .unwrap();
    (stdout, stderr)
}

fn password_credentials() -> SshCredentials {
    SshCredentials {
        username: "deploy".into(),
        auth: SshAuth::Password {
            password: "secret".into(),
        },
        host_key_policy: HostKeyPolicy::AcceptAny,
    }
}

fn ssh_config(remote_socket_path: &str) -> TransportConfig {
    TransportConfig::for_descriptor(TransportDescriptor::ssh(
        "build-01",
        22,
        password_credentials(),
        remote_socket_path,
    ))
}

// =============================================================================
// Local socket
// =============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_local_socket_attach_end_to_end() {
    use tokio::net::UnixListener;

    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let engine = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        serve_hijack(
            stream,
            EngineScript::multiplexed(&[
                (StreamChannel::Stdout, b"total 0\n"),
                (StreamChannel::Stderr, b"ls: warning\n"),
            ]),
        )
        .await
    });

    let config = TransportConfig {
        api_version: Some("1.45".into()),
        ..TransportConfig::for_descriptor(TransportDescriptor::local_socket(&path))
    };
    let agent = ConnectionAgent::acquire(&config).await.unwrap();
    assert_eq!(agent.kind(), TransportKind::LocalSocket);
    assert_eq!(agent.base_url(), "http://0.0.0.0/v1.45");

    let (stdout, stderr) = attach(&agent, b"exit\n").await;
    assert_eq!(stdout, b"total 0\n");
    assert_eq!(stderr, b"ls: warning\n");

    let (head, stdin) = engine.await.unwrap();
    assert!(head.starts_with(&format!("POST {ATTACH} HTTP/1.1\r\n")));
    assert!(head.contains("Upgrade: tcp\r\n"));
    assert_eq!(stdin, b"exit\n");

    let stats = agent.stats();
    assert_eq!(stats.channels_opened, 1);
    assert_eq!(stats.open_channels, 0);
    agent.release().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_non_streaming_response_is_rejected() {
    use tokio::net::UnixListener;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.sock");
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        serve_hijack(
            stream,
            EngineScript {
                content_type: "text/plain".into(),
                body: b"not a stream".to_vec(),
            },
        )
        .await
    });

    let agent = ConnectionAgent::acquire(&TransportConfig::for_descriptor(
        TransportDescriptor::local_socket(&path),
    ))
    .await
    .unwrap();
    let channel = agent.open_channel().await.unwrap();
    let result = hijack_stream(channel, &UpgradeRequest::post(ATTACH)).await;

    match result {
        Err(HijackError::Classify(e)) => {
            assert_eq!(e.observed.as_deref(), Some("text/plain"));
        }
        Err(other) => panic!("expected a classification error, got {other}"),
        Ok(_) => panic!("text/plain must not be classified as a stream"),
    }
    agent.release().await.unwrap();
}

// =============================================================================
// SSH tunnel
// =============================================================================

#[tokio::test]
async fn test_ssh_agent_reuses_one_session() {
    init_tracing();
    let connector = MockConnector::new(MockSession::new(EngineScript::multiplexed(&[(
        StreamChannel::Stdout,
        b"hello",
    )])));

    let agent = ConnectionAgent::acquire_with(&ssh_config("/var/run/docker.sock"), &connector)
        .await
        .unwrap();
    assert_eq!(agent.kind(), TransportKind::Ssh);

    let results =
        futures::future::join_all((0..3).map(|_| attach(&agent, b""))).await;
    for (stdout, stderr) in results {
        assert_eq!(stdout, b"hello");
        assert!(stderr.is_empty());
    }

    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.session.opened(), 3);
    let stats = agent.stats();
    assert_eq!(stats.channels_opened, 3);
    assert_eq!(stats.open_channels, 0);

    assert!(!connector.session.ended());
    agent.release().await.unwrap();
    assert!(connector.session.ended());
}

#[tokio::test]
async fn test_ssh_release_waits_for_open_channels() {
    let connector = MockConnector::new(MockSession::new(EngineScript::raw(b"")));
    let agent = ConnectionAgent::acquire_with(&ssh_config("/var/run/docker.sock"), &connector)
        .await
        .unwrap();

    let channel = agent.open_channel().await.unwrap();
    let release = tokio::spawn(agent.release_with_timeout(Duration::from_secs(10)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !connector.session.ended(),
        "session must outlive channels still in use"
    );

    drop(channel);
    release.await.unwrap().unwrap();
    assert!(connector.session.ended());
}

#[tokio::test]
async fn test_ssh_missing_remote_socket_keeps_session() {
    let connector = MockConnector::new(MockSession::new(EngineScript::raw(b"")));
    let agent = ConnectionAgent::acquire_with(&ssh_config("/run/missing.sock"), &connector)
        .await
        .unwrap();

    for _ in 0..2 {
        let result = agent.open_channel().await;
        assert!(matches!(result, Err(TransportError::Channel(_))));
    }
    assert_eq!(connector.session.opened(), 2);
    agent.release().await.unwrap();
}

#[tokio::test]
async fn test_ssh_session_failure_is_terminal() {
    let connector = MockConnector::new(MockSession::dead(EngineScript::raw(b"")));
    let agent = ConnectionAgent::acquire_with(&ssh_config("/var/run/docker.sock"), &connector)
        .await
        .unwrap();

    let first = agent.open_channel().await;
    assert!(matches!(first, Err(TransportError::Session(_))));

    let second = agent.open_channel().await;
    assert!(matches!(second, Err(TransportError::Session(_))));
    assert_eq!(
        connector.session.opened(),
        1,
        "a failed session is not asked again"
    );
    assert_eq!(agent.stats().channel_failures, 2);
    let _ = agent.release_with_timeout(Duration::from_millis(10)).await;
}

// =============================================================================
// TLS
// =============================================================================

struct TestPki {
    ca_pem: String,
    server_cert: rustls::pki_types::CertificateDer<'static>,
    server_key: Vec<u8>,
}

fn test_pki() -> TestPki {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let server = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

    TestPki {
        ca_pem: ca.pem(),
        server_cert: server.der().clone(),
        server_key: server_key.serialize_der(),
    }
}

fn acceptor(pki: &TestPki) -> tokio_rustls::TlsAcceptor {
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(
        vec![pki.server_cert.clone()],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pki.server_key.clone())),
    )
    .unwrap();
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}

fn ca_only(ca_pem: &str) -> TlsMaterial {
    TlsMaterial {
        ca_pem: Some(ca_pem.as_bytes().to_vec()),
        cert_pem: None,
        key_pem: None,
    }
}

#[tokio::test]
async fn test_tls_attach_end_to_end() {
    init_tracing();
    let pki = test_pki();
    let acceptor = acceptor(&pki);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let tls = acceptor.accept(tcp).await.unwrap();
        serve_hijack(tls, EngineScript::raw(b"root@web:/# ")).await
    });

    let config = TransportConfig::for_descriptor(TransportDescriptor::https(
        "localhost",
        port,
        Some(ca_only(&pki.ca_pem)),
    ));
    let agent = ConnectionAgent::acquire(&config).await.unwrap();
    assert_eq!(agent.kind(), TransportKind::Https);
    assert_eq!(agent.base_url(), "https://0.0.0.0");

    let channel = agent.open_channel().await.unwrap();
    let (_meta, socket) = hijack_stream(channel, &UpgradeRequest::post(ATTACH))
        .await
        .unwrap();
    assert_eq!(socket.kind(), StreamKind::Raw);

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let outcome = demux(
        socket,
        tokio::io::empty(),
        &mut stdout,
        &mut stderr,
        DemuxOptions::default(),
    )
    .await;
    assert_eq!(outcome.into_result().unwrap(), (12, 0));
    assert_eq!(stdout, b"root@web:/# ");
    agent.release().await.unwrap();
}

#[tokio::test]
async fn test_tls_untrusted_server_fails_to_open() {
    let server_pki = test_pki();
    let other_ca = test_pki();
    let acceptor = acceptor(&server_pki);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        if let Ok((tcp, _)) = listener.accept().await {
            let _ = acceptor.accept(tcp).await;
        }
    });

    let config = TransportConfig::for_descriptor(TransportDescriptor::https(
        "localhost",
        port,
        Some(ca_only(&other_ca.ca_pem)),
    ));
    let agent = ConnectionAgent::acquire(&config).await.unwrap();
    let result = agent.open_channel().await;
    assert!(matches!(result, Err(TransportError::Connection { .. })));
    assert_eq!(agent.stats().channel_failures, 1);
    agent.release().await.unwrap();
}

// =============================================================================
// Configuration
// =============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_config_file_drives_acquisition() {
    use tokio::net::UnixListener;

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("engine.sock");
    let _listener = UnixListener::bind(&socket_path).unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "[engine]\nhost = \"unix://{}\"\napi_version = \"1.44\"\n\n[connection]\nmax_connections = 2\n",
        socket_path.display()
    )
    .unwrap();

    let config = load_config_with_env(Some(file.path().to_path_buf()), |_| None).unwrap();
    assert_eq!(config.transport.max_connections, 2);

    let agent = ConnectionAgent::acquire(&config.transport).await.unwrap();
    assert_eq!(agent.kind(), TransportKind::LocalSocket);
    assert_eq!(agent.base_url(), "http://0.0.0.0/v1.44");
    agent.release().await.unwrap();
}
