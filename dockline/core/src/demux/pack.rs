//! Packing separate raw sockets into one multiplexed socket
//!
//! The inverse of demultiplexing: stdout and stderr read from their own raw
//! sockets are re-framed onto one socket, and bytes written to that socket
//! go to the stdin socket. The result can be handed to anything that expects
//! a multiplexed hijacked socket.
//!
//! ```text
//!  stdout socket ─┐
//!                 ├─► queue ─► encode_frame ─► packed socket (read side)
//!  stderr socket ─┘
//!  stdin socket ◄──────────────────────────── packed socket (write side)
//! ```

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use super::frame::{encode_frame, StreamChannel};
use super::raw::{read_optional, RawStdio};
use super::stream::{forward_stdin, AbortOnDrop, DemuxOptions};
use crate::hijack::StreamSocket;

/// In-memory pipe capacity between the pump and the packed socket
const PIPE_CAPACITY: usize = 64 * 1024;

/// Multiplexed view over separate raw sockets
///
/// Reads yield encoded frames and reach EOF once both output sockets have.
/// Dropping it stops the background pump.
#[derive(Debug)]
pub struct PackedSocket {
    inner: DuplexStream,
    _pump: AbortOnDrop,
}

impl AsyncRead for PackedSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PackedSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Pack separate raw sockets into one multiplexed socket
///
/// Output chunks are framed in the order they arrive, tagged stdout or
/// stderr. Shutting down the packed socket's write side shuts down the stdin
/// socket when `close_stdin_on_eof` is set. A read error on an output socket
/// ends the packed stream early.
pub fn pack(stdio: RawStdio, options: DemuxOptions) -> StreamSocket<PackedSocket> {
    let RawStdio {
        stdin,
        stdout,
        stderr,
    } = stdio;
    let (user, engine) = tokio::io::duplex(PIPE_CAPACITY);
    let (mut engine_read, mut engine_write) = tokio::io::split(engine);
    let (tx, mut rx) = mpsc::channel(options.buffer_size.max(1));
    let close_on_eof = options.close_stdin_on_eof;

    let pump = tokio::spawn(async move {
        let readers = async move {
            tokio::join!(
                read_optional(stdout, StreamChannel::Stdout, tx.clone()),
                read_optional(stderr, StreamChannel::Stderr, tx),
            );
        };

        let writer = async move {
            while let Some(item) = rx.recv().await {
                let (channel, payload) = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!(error = %e, "Packed output socket failed");
                        break;
                    }
                };
                let frame = match encode_frame(channel, &payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping unencodable chunk");
                        break;
                    }
                };
                if let Err(e) = engine_write.write_all(&frame).await {
                    tracing::debug!(error = %e, "Packed socket closed by reader");
                    return;
                }
            }
            let _ = engine_write.shutdown().await;
        };

        let input = async move {
            let result = match stdin {
                Some(mut socket) => forward_stdin(&mut engine_read, &mut socket, close_on_eof).await,
                None => forward_stdin(&mut engine_read, &mut tokio::io::sink(), false).await,
            };
            if let Err(e) = result {
                tracing::debug!(error = %e, "Packed stdin forwarding stopped");
            }
        };

        tokio::join!(readers, writer, input);
    });

    StreamSocket::Multiplexed(PackedSocket {
        inner: user,
        _pump: AbortOnDrop(pump),
    })
}
