//! Socket demultiplexing
//!
//! Drives a classified hijacked socket: forwards a stdin source into it and
//! drains its output into separate stdout and stderr sinks. The stdin
//! direction and the output direction run concurrently and independently.
//!
//! # Data Flow
//!
//! ```text
//!  stdin ──copy──► write half ─┐
//!                              │ hijacked socket
//!  stdout sink ◄── queue ◄──┐  │
//!                           ├──┴─ read half ─► FrameDecoder ─► Partitioner
//!  stderr sink ◄── queue ◄──┘
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::frame::{FrameDecoder, StreamChannel, MAX_FRAME_SIZE};
use super::partition::{partition, OutputItem, PartitionStats, Partitioner};
use super::raw::{copy_raw, read_tagged, route_raw, READ_CHUNK};
use super::DemuxError;
use crate::hijack::{StreamKind, StreamSocket};
use crate::transport::DEFAULT_DEMUX_BUFFER_SIZE;

// ============================================================================
// Options and outcome
// ============================================================================

/// Demultiplexing options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DemuxOptions {
    /// Frames one output may run ahead of the other
    pub buffer_size: usize,

    /// Half-close the socket's write side when stdin reaches EOF
    pub close_stdin_on_eof: bool,

    /// Longest frame payload accepted before the stream fails
    pub max_frame_size: usize,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_DEMUX_BUFFER_SIZE,
            close_stdin_on_eof: true,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl DemuxOptions {
    /// Options with a specific lead bound
    #[must_use]
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            ..Default::default()
        }
    }
}

/// How each direction of a demultiplexed socket ended
#[derive(Debug)]
pub struct DemuxOutcome {
    /// Bytes written to the stdout sink, or the error that ended it
    pub stdout: Result<u64, DemuxError>,
    /// Bytes written to the stderr sink, or the error that ended it
    pub stderr: Result<u64, DemuxError>,
    /// Bytes forwarded from stdin; `Cancelled` if output ended first
    pub stdin: Result<u64, DemuxError>,
}

impl DemuxOutcome {
    /// Both output byte counts, or the first output error
    pub fn into_result(self) -> Result<(u64, u64), DemuxError> {
        Ok((self.stdout?, self.stderr?))
    }
}

/// How a single-sink demultiplex ended
#[derive(Debug)]
pub struct CombinedOutcome {
    /// Bytes written to the sink, or the error that ended it
    pub output: Result<u64, DemuxError>,
    /// Bytes forwarded from stdin; `Cancelled` if output ended first
    pub stdin: Result<u64, DemuxError>,
}

// ============================================================================
// Demultiplexing into sinks
// ============================================================================

/// Demultiplex `socket` into separate stdout and stderr sinks
///
/// `stdin` is copied into the socket at the same time. Completes when the
/// socket reaches end of stream. Dropping the returned future closes the
/// socket and discards any partial frame.
///
/// A raw socket has one combined output that cannot be told apart. It is
/// written once, to `stdout`, rather than duplicated into both sinks;
/// `stderr` completes with zero bytes. Use [`demux_to_single_sink`] to make
/// the single combined sequence explicit.
pub async fn demux<S, I, O, E>(
    socket: StreamSocket<S>,
    mut stdin: I,
    stdout: &mut O,
    stderr: &mut E,
    options: DemuxOptions,
) -> DemuxOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let kind = socket.kind();
    let (mut reader, mut writer) = tokio::io::split(socket.into_inner());
    let (partitioner, outputs) = partition(options.buffer_size);

    let output = async {
        tokio::join!(
            route(&mut reader, kind, partitioner, options.max_frame_size),
            drain(outputs.stdout, stdout, "writing stdout"),
            drain(outputs.stderr, stderr, "writing stderr"),
        )
    };
    let input = forward_stdin(&mut stdin, &mut writer, options.close_stdin_on_eof);

    let ((stats, stdout, stderr), stdin) = run_with_stdin(output, input).await;

    tracing::debug!(
        kind = ?kind,
        stdout_frames = stats.stdout_frames,
        stderr_frames = stats.stderr_frames,
        "Demux finished"
    );

    DemuxOutcome {
        stdout,
        stderr,
        stdin,
    }
}

/// Demultiplex `socket` writing stdout and stderr payloads into one sink
///
/// Payloads are written in arrival order, so the interleaving the engine
/// produced is kept.
pub async fn demux_to_single_sink<S, I, O>(
    socket: StreamSocket<S>,
    mut stdin: I,
    sink: &mut O,
    options: DemuxOptions,
) -> CombinedOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let kind = socket.kind();
    let (mut reader, mut writer) = tokio::io::split(socket.into_inner());

    let output = async {
        match kind {
            StreamKind::Raw => copy_raw(&mut reader, sink).await,
            StreamKind::Multiplexed => copy_frames(&mut reader, sink, options.max_frame_size).await,
        }
    };
    let input = forward_stdin(&mut stdin, &mut writer, options.close_stdin_on_eof);

    let (output, stdin) = run_with_stdin(output, input).await;
    if let Err(e) = &output {
        tracing::warn!(error = %e, "Demux to single sink failed");
    }
    CombinedOutcome { output, stdin }
}

/// Run the output side to completion while stdin forwarding runs alongside
pub(crate) async fn run_with_stdin<T>(
    output: impl std::future::Future<Output = T>,
    input: impl std::future::Future<Output = Result<u64, DemuxError>>,
) -> (T, Result<u64, DemuxError>) {
    tokio::pin!(output, input);
    let mut stdin_result = None;
    let done = loop {
        tokio::select! {
            result = &mut input, if stdin_result.is_none() => stdin_result = Some(result),
            done = &mut output => break done,
        }
    };
    (done, stdin_result.unwrap_or(Err(DemuxError::Cancelled)))
}

// ============================================================================
// Demultiplexing into streams
// ============================================================================

/// Aborts the socket reader task once every handle is gone
#[derive(Debug)]
pub(crate) struct AbortOnDrop(pub(crate) JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One demultiplexed output as a stream of payloads
///
/// Ends after the last payload on clean end of stream, or after yielding
/// the error that ended the socket.
#[derive(Debug)]
pub struct OutputStream {
    inner: ReceiverStream<OutputItem>,
    _pump: Arc<AbortOnDrop>,
}

impl Stream for OutputStream {
    type Item = OutputItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Independently consumable outputs of a socket plus its input half
#[derive(Debug)]
pub struct DemuxStreams<S> {
    /// Stdout payloads
    pub stdout: OutputStream,
    /// Stderr payloads; empty for raw sockets, whose combined output is
    /// yielded once on `stdout`
    pub stderr: OutputStream,
    /// Write half of the socket for stdin
    pub stdin: WriteHalf<S>,
}

/// Split `socket` into stdout and stderr streams and a stdin writer
///
/// A background task reads the socket. It stops when the socket ends or
/// when both output streams have been dropped.
pub fn split<S>(socket: StreamSocket<S>, options: DemuxOptions) -> DemuxStreams<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let kind = socket.kind();
    let (mut reader, writer) = tokio::io::split(socket.into_inner());
    let (partitioner, outputs) = partition(options.buffer_size);

    let pump = tokio::spawn(async move {
        let stats = route(&mut reader, kind, partitioner, options.max_frame_size).await;
        tracing::debug!(
            stdout_frames = stats.stdout_frames,
            stderr_frames = stats.stderr_frames,
            "Demux pump finished"
        );
    });
    let pump = Arc::new(AbortOnDrop(pump));

    DemuxStreams {
        stdout: OutputStream {
            inner: ReceiverStream::new(outputs.stdout),
            _pump: Arc::clone(&pump),
        },
        stderr: OutputStream {
            inner: ReceiverStream::new(outputs.stderr),
            _pump: pump,
        },
        stdin: writer,
    }
}

// ============================================================================
// Tagged output
// ============================================================================

/// One output chunk labelled with the stream it came from
pub type TaggedItem = Result<(StreamChannel, Vec<u8>), DemuxError>;

/// Stdout and stderr merged into one stream of tagged chunks
///
/// Chunks keep the order in which they were read. Ends after the last chunk,
/// or after yielding the error that ended a source.
#[derive(Debug)]
pub struct TaggedStream {
    inner: ReceiverStream<TaggedItem>,
    _pump: AbortOnDrop,
}

impl TaggedStream {
    pub(crate) fn new(rx: mpsc::Receiver<TaggedItem>, pump: JoinHandle<()>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
            _pump: AbortOnDrop(pump),
        }
    }
}

impl Stream for TaggedStream {
    type Item = TaggedItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Tagged output of a socket plus its input half
#[derive(Debug)]
pub struct TaggedStreams<S> {
    /// Stdout and stderr chunks in engine order
    pub output: TaggedStream,
    /// Write half of the socket for stdin
    pub stdin: WriteHalf<S>,
}

/// Turn `socket` into one tagged output stream and a stdin writer
///
/// Unlike [`split`], the engine's interleaving of stdout and stderr is kept
/// exactly. Raw sockets yield every chunk tagged as stdout. At most
/// `buffer_size` chunks wait for the consumer before the socket stops being
/// read.
pub fn split_tagged<S>(socket: StreamSocket<S>, options: DemuxOptions) -> TaggedStreams<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let kind = socket.kind();
    let (mut reader, writer) = tokio::io::split(socket.into_inner());
    let (tx, rx) = mpsc::channel(options.buffer_size.max(1));

    let pump = tokio::spawn(async move {
        match kind {
            StreamKind::Raw => read_tagged(&mut reader, StreamChannel::Stdout, tx).await,
            StreamKind::Multiplexed => tag_frames(&mut reader, tx, options.max_frame_size).await,
        }
    });

    TaggedStreams {
        output: TaggedStream::new(rx, pump),
        stdin: writer,
    }
}

/// Merge two raw output sockets into one tagged stream
///
/// Both sockets are read concurrently and chunks are yielded as they
/// arrive. Pass [`tokio::io::empty`] for an output that was not attached.
pub fn merge_tagged<O, E>(mut stdout: O, mut stderr: E, options: DemuxOptions) -> TaggedStream
where
    O: AsyncRead + Send + Unpin + 'static,
    E: AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(options.buffer_size.max(1));

    let pump = tokio::spawn(async move {
        tokio::join!(
            read_tagged(&mut stdout, StreamChannel::Stdout, tx.clone()),
            read_tagged(&mut stderr, StreamChannel::Stderr, tx),
        );
    });

    TaggedStream::new(rx, pump)
}

// ============================================================================
// Internals
// ============================================================================

/// Read the socket and route its output until end of stream or error
async fn route<R>(
    reader: &mut R,
    kind: StreamKind,
    mut partitioner: Partitioner,
    max_frame_size: usize,
) -> PartitionStats
where
    R: AsyncRead + Unpin,
{
    let result = match kind {
        StreamKind::Raw => route_raw(reader, &mut partitioner).await,
        StreamKind::Multiplexed => route_frames(reader, &mut partitioner, max_frame_size).await,
    };
    match result {
        Ok(()) => partitioner.finish(),
        Err(e) => {
            tracing::warn!(error = %e, "Hijacked stream failed");
            partitioner.fail(e).await
        }
    }
}

async fn route_frames<R>(
    reader: &mut R,
    partitioner: &mut Partitioner,
    max_frame_size: usize,
) -> Result<(), DemuxError>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| DemuxError::io("reading multiplexed socket", e))?;
        if n == 0 {
            decoder.finish()?;
            return Ok(());
        }
        decoder.push(&buf[..n]);
        while let Some(frame) = decoder.decode()? {
            if !partitioner.deliver(frame).await {
                return Ok(());
            }
        }
    }
}

async fn copy_frames<R, W>(reader: &mut R, sink: &mut W, max_frame_size: usize) -> Result<u64, DemuxError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut written = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| DemuxError::io("reading multiplexed socket", e))?;
        if n == 0 {
            decoder.finish()?;
            return Ok(written);
        }
        decoder.push(&buf[..n]);
        while let Some(frame) = decoder.decode()? {
            if frame.channel == StreamChannel::Stdin {
                continue;
            }
            write_payload(sink, &frame.payload, "writing output").await?;
            written += frame.payload.len() as u64;
        }
    }
}

async fn drain<W>(
    mut rx: mpsc::Receiver<OutputItem>,
    sink: &mut W,
    context: &'static str,
) -> Result<u64, DemuxError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(item) = rx.recv().await {
        let payload = item?;
        write_payload(sink, &payload, context).await?;
        written += payload.len() as u64;
    }
    Ok(written)
}

async fn tag_frames<R>(reader: &mut R, tx: mpsc::Sender<TaggedItem>, max_frame_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; READ_CHUNK];
    let result: Result<(), DemuxError> = async {
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| DemuxError::io("reading multiplexed socket", e))?;
            if n == 0 {
                decoder.finish()?;
                return Ok(());
            }
            decoder.push(&buf[..n]);
            while let Some(frame) = decoder.decode()? {
                if frame.channel == StreamChannel::Stdin {
                    continue;
                }
                if tx.send(Ok((frame.channel, frame.payload))).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(error = %e, "Hijacked stream failed");
        let _ = tx.send(Err(e)).await;
    }
}

pub(crate) async fn write_payload<W>(sink: &mut W, payload: &[u8], context: &'static str) -> Result<(), DemuxError>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(payload)
        .await
        .map_err(|e| DemuxError::io(context, e))?;
    sink.flush().await.map_err(|e| DemuxError::io(context, e))
}

pub(crate) async fn forward_stdin<I, W>(stdin: &mut I, writer: &mut W, close_on_eof: bool) -> Result<u64, DemuxError>
where
    I: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(stdin, writer)
        .await
        .map_err(|e| DemuxError::io("forwarding stdin", e))?;
    if close_on_eof {
        writer
            .shutdown()
            .await
            .map_err(|e| DemuxError::io("closing stdin", e))?;
    }
    tracing::debug!(bytes = copied, "Stdin forwarded");
    Ok(copied)
}
