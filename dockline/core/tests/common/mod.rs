//! Shared helpers for the integration tests: a scripted engine and an
//! in-memory SSH client.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use dockline_core::transport::ssh::{ForwardError, SshTarget};
use dockline_core::{
    encode_frame, BoxedChannel, ShellConnector, ShellSession, StreamChannel, TransportError,
};

pub const MULTIPLEXED: &str = "application/vnd.docker.multiplexed-stream";
pub const RAW: &str = "application/vnd.docker.raw-stream";

/// Install a test-writer subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Concatenate encoded frames
pub fn multiplexed(frames: &[(StreamChannel, &[u8])]) -> Vec<u8> {
    frames
        .iter()
        .flat_map(|(channel, payload)| encode_frame(*channel, payload).unwrap())
        .collect()
}

/// What the scripted engine answers to an upgrade request
#[derive(Clone, Debug)]
pub struct EngineScript {
    pub content_type: String,
    pub body: Vec<u8>,
}

impl EngineScript {
    pub fn multiplexed(frames: &[(StreamChannel, &[u8])]) -> Self {
        Self {
            content_type: MULTIPLEXED.to_string(),
            body: multiplexed(frames),
        }
    }

    pub fn raw(body: &[u8]) -> Self {
        Self {
            content_type: RAW.to_string(),
            body: body.to_vec(),
        }
    }
}

/// Serve one hijacked request on `stream`
///
/// Reads the request head, answers `101` with the script's content type and
/// body, half-closes, then collects whatever the client sends until it
/// closes its side. Returns the request head and the bytes received after it;
/// the head is empty if the client went away without sending a request.
pub async fn serve_hijack<S>(mut stream: S, script: EngineScript) -> (String, Vec<u8>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(p) = received.windows(4).position(|w| w == b"\r\n\r\n") {
            break p + 4;
        }
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return (String::new(), received);
        }
        received.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8(received[..head_end].to_vec()).unwrap();
    let mut stdin = received.split_off(head_end);

    let response = format!(
        "HTTP/1.1 101 UPGRADED\r\nContent-Type: {}\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n",
        script.content_type
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    stream.write_all(&script.body).await.unwrap();
    stream.flush().await.unwrap();
    stream.shutdown().await.unwrap();

    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => stdin.extend_from_slice(&chunk[..n]),
        }
    }
    (head, stdin)
}

// =============================================================================
// In-memory SSH client
// =============================================================================

/// Session whose forwarded channels are served by a scripted engine
pub struct MockSession {
    script: EngineScript,
    pub opened: AtomicUsize,
    pub ended: AtomicBool,
    fail_opens_with_session_error: bool,
}

impl MockSession {
    pub fn new(script: EngineScript) -> Self {
        Self {
            script,
            opened: AtomicUsize::new(0),
            ended: AtomicBool::new(false),
            fail_opens_with_session_error: false,
        }
    }

    pub fn dead(script: EngineScript) -> Self {
        Self {
            fail_opens_with_session_error: true,
            ..Self::new(script)
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShellSession for MockSession {
    async fn open_forwarded_local_stream(
        &self,
        socket_path: &str,
    ) -> Result<BoxedChannel, ForwardError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.fail_opens_with_session_error {
            return Err(ForwardError::Session("connection reset by peer".into()));
        }
        if socket_path != "/var/run/docker.sock" {
            return Err(ForwardError::Channel(format!("{socket_path}: no such file")));
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        let script = self.script.clone();
        tokio::spawn(async move {
            serve_hijack(server, script).await;
        });
        Ok(Box::new(client))
    }

    fn is_closed(&self) -> bool {
        self.ended()
    }

    async fn end(&self) -> Result<(), TransportError> {
        self.ended.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out one shared [`MockSession`]
pub struct MockConnector {
    pub session: Arc<MockSession>,
    pub connects: AtomicUsize,
}

impl MockConnector {
    pub fn new(session: MockSession) -> Self {
        Self {
            session: Arc::new(session),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShellConnector for MockConnector {
    async fn connect(&self, _target: &SshTarget) -> Result<Arc<dyn ShellSession>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let session: Arc<dyn ShellSession> = self.session.clone();
        Ok(session)
    }
}
