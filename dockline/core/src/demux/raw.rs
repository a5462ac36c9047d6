//! Raw stream passthrough
//!
//! A raw socket carries the PTY bytes of the process with stdout and stderr
//! already merged. Nothing is parsed; chunks are forwarded as they arrive.
//!
//! Some engines hand out one raw socket per standard stream instead, one
//! attach request each. [`RawStdio`] groups those sockets so they can be
//! drained like a single hijacked socket.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::frame::{Frame, StreamChannel};
use super::partition::Partitioner;
use super::stream::{
    forward_stdin, run_with_stdin, write_payload, CombinedOutcome, DemuxOptions, DemuxOutcome,
    TaggedItem,
};
use super::DemuxError;
use crate::transport::{BoxedChannel, DuplexChannel};

/// Socket read size
pub(crate) const READ_CHUNK: usize = 32 * 1024;

/// Forward raw chunks to the stdout output until EOF
///
/// The stderr output receives nothing and completes when the socket does.
pub(crate) async fn route_raw<R>(
    reader: &mut R,
    partitioner: &mut Partitioner,
) -> Result<(), DemuxError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| DemuxError::io("reading raw socket", e))?;
        if n == 0 {
            return Ok(());
        }
        let frame = Frame {
            channel: StreamChannel::Stdout,
            payload: buf[..n].to_vec(),
        };
        if !partitioner.deliver(frame).await {
            return Ok(());
        }
    }
}

/// Copy a raw socket into one sink, returning the byte count
pub async fn copy_raw<R, W>(reader: &mut R, sink: &mut W) -> Result<u64, DemuxError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut written = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| DemuxError::io("reading raw socket", e))?;
        if n == 0 {
            return Ok(written);
        }
        sink.write_all(&buf[..n])
            .await
            .map_err(|e| DemuxError::io("writing output", e))?;
        sink.flush()
            .await
            .map_err(|e| DemuxError::io("writing output", e))?;
        written += n as u64;
    }
}

// ============================================================================
// Separate raw sockets
// ============================================================================

/// One raw socket per standard stream of a process
///
/// Any of the three may be absent when that stream was not attached.
#[derive(Default)]
pub struct RawStdio {
    /// Socket the process reads stdin from
    pub stdin: Option<BoxedChannel>,
    /// Socket carrying stdout
    pub stdout: Option<BoxedChannel>,
    /// Socket carrying stderr
    pub stderr: Option<BoxedChannel>,
}

impl RawStdio {
    /// No sockets attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the stdin socket
    #[must_use]
    pub fn with_stdin(mut self, socket: impl DuplexChannel + 'static) -> Self {
        self.stdin = Some(Box::new(socket));
        self
    }

    /// Attach the stdout socket
    #[must_use]
    pub fn with_stdout(mut self, socket: impl DuplexChannel + 'static) -> Self {
        self.stdout = Some(Box::new(socket));
        self
    }

    /// Attach the stderr socket
    #[must_use]
    pub fn with_stderr(mut self, socket: impl DuplexChannel + 'static) -> Self {
        self.stderr = Some(Box::new(socket));
        self
    }
}

impl fmt::Debug for RawStdio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawStdio")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Drain separate raw output sockets into their own sinks
///
/// `stdin` is copied into the stdin socket at the same time. Completes when
/// both output sockets reach end of stream; a missing output completes with
/// zero bytes. Without a stdin socket the source is never read.
pub async fn demux_raw_stdio<I, O, E>(
    stdio: RawStdio,
    mut stdin: I,
    stdout: &mut O,
    stderr: &mut E,
    options: DemuxOptions,
) -> DemuxOutcome
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let RawStdio {
        stdin: stdin_socket,
        stdout: stdout_socket,
        stderr: stderr_socket,
    } = stdio;

    let output = async {
        tokio::join!(
            copy_optional(stdout_socket, stdout),
            copy_optional(stderr_socket, stderr),
        )
    };
    let input = forward_optional(stdin_socket, &mut stdin, options.close_stdin_on_eof);

    let ((stdout, stderr), stdin) = run_with_stdin(output, input).await;
    DemuxOutcome {
        stdout,
        stderr,
        stdin,
    }
}

/// Drain separate raw output sockets into one sink in arrival order
pub async fn demux_raw_stdio_to_single_sink<I, O>(
    stdio: RawStdio,
    mut stdin: I,
    sink: &mut O,
    options: DemuxOptions,
) -> CombinedOutcome
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let RawStdio {
        stdin: stdin_socket,
        stdout: stdout_socket,
        stderr: stderr_socket,
    } = stdio;

    let output = async {
        let (tx, mut rx) = mpsc::channel(options.buffer_size.max(1));
        let readers = async move {
            tokio::join!(
                read_optional(stdout_socket, StreamChannel::Stdout, tx.clone()),
                read_optional(stderr_socket, StreamChannel::Stderr, tx),
            );
        };
        let writer = async move {
            let mut written = 0u64;
            while let Some(item) = rx.recv().await {
                let (_, payload) = item?;
                write_payload(sink, &payload, "writing output").await?;
                written += payload.len() as u64;
            }
            Ok::<u64, DemuxError>(written)
        };
        let ((), written) = tokio::join!(readers, writer);
        written
    };
    let input = forward_optional(stdin_socket, &mut stdin, options.close_stdin_on_eof);

    let (output, stdin) = run_with_stdin(output, input).await;
    if let Err(e) = &output {
        tracing::warn!(error = %e, "Raw stdio to single sink failed");
    }
    CombinedOutcome { output, stdin }
}

/// Send chunks read from `reader` tagged with `channel` until EOF
///
/// A read error is sent as the last item. Stops early once the receiver is
/// gone.
pub(crate) async fn read_tagged<R>(
    reader: &mut R,
    channel: StreamChannel,
    tx: mpsc::Sender<TaggedItem>,
) where
    R: AsyncRead + Unpin,
{
    let context = match channel {
        StreamChannel::Stderr => "reading stderr socket",
        _ => "reading stdout socket",
    };
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let item = match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => Ok((channel, buf[..n].to_vec())),
            Err(e) => Err(DemuxError::io(context, e)),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            return;
        }
    }
}

pub(crate) async fn read_optional(
    socket: Option<BoxedChannel>,
    channel: StreamChannel,
    tx: mpsc::Sender<TaggedItem>,
) {
    if let Some(mut socket) = socket {
        read_tagged(&mut socket, channel, tx).await;
    }
}

async fn copy_optional<W>(socket: Option<BoxedChannel>, sink: &mut W) -> Result<u64, DemuxError>
where
    W: AsyncWrite + Unpin,
{
    match socket {
        Some(mut socket) => copy_raw(&mut socket, sink).await,
        None => Ok(0),
    }
}

async fn forward_optional<I>(
    socket: Option<BoxedChannel>,
    stdin: &mut I,
    close_on_eof: bool,
) -> Result<u64, DemuxError>
where
    I: AsyncRead + Unpin,
{
    match socket {
        Some(mut socket) => forward_stdin(stdin, &mut socket, close_on_eof).await,
        None => Ok(0),
    }
}
