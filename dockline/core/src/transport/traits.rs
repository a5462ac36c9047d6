//! Transport Traits
//!
//! Core abstractions shared by every transport: the duplex byte channel handed
//! to the HTTP layer, and the error type for acquisition and channel opening.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A bidirectional byte stream with independent read and write directions.
///
/// Each direction reports end-of-stream and errors on its own: a read of zero
/// bytes is EOF for the read side, `poll_shutdown` half-closes the write side.
pub trait DuplexChannel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexChannel for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased duplex channel
pub type BoxedChannel = Box<dyn DuplexChannel>;

/// Which kind of transport a descriptor or agent refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Local domain socket
    LocalSocket,
    /// SSH forwarded local stream
    Ssh,
    /// Plain TCP
    Http,
    /// TLS over TCP
    Https,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LocalSocket => "unix",
            Self::Ssh => "ssh",
            Self::Http => "http",
            Self::Https => "https",
        };
        f.write_str(name)
    }
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connect, handshake or authentication failed, including timeouts
    #[error("{transport} connection failed: {cause}")]
    Connection {
        /// Transport that failed
        transport: TransportKind,
        /// Human readable cause
        cause: String,
    },

    /// Opening one forwarded channel failed; the session is still usable
    #[error("channel open failed: {0}")]
    Channel(String),

    /// The SSH session is gone; no further channels can be opened
    #[error("ssh session failed: {0}")]
    Session(String),

    /// The agent was already released
    #[error("connection agent already released")]
    Released,

    /// Descriptor could not be built or parsed
    #[error("invalid transport descriptor: {0}")]
    InvalidDescriptor(String),

    /// TLS material could not be loaded
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

impl TransportError {
    /// Build a connection error for a transport
    pub fn connection(transport: TransportKind, cause: impl fmt::Display) -> Self {
        Self::Connection {
            transport,
            cause: cause.to_string(),
        }
    }

    /// Whether this error ends the SSH session for all channels
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Session(_) | Self::Released)
    }
}

/// A channel that keeps a guard alive for as long as the stream exists.
///
/// Used to tie connection-pool permits and open-channel counters to the
/// lifetime of the stream handed to the caller.
pub struct GuardedChannel<G> {
    inner: BoxedChannel,
    _guard: G,
}

impl<G> GuardedChannel<G> {
    /// Wrap a channel with a guard that is dropped together with it
    pub fn new(inner: BoxedChannel, guard: G) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl<G: Unpin> AsyncRead for GuardedChannel<G> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<G: Unpin> AsyncWrite for GuardedChannel<G> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
