//! Stream Demultiplexing
//!
//! Turns a classified hijacked socket into separate stdout and stderr
//! outputs while stdin is forwarded into it.
//!
//! - [`frame`]: the 8-byte-header wire format and its resumable decoder
//! - [`partition`]: bounded-lead fork of frames into two ordered outputs
//! - [`raw`]: passthrough for raw PTY sockets and separate raw stdio sockets
//! - [`pack`]: re-frame separate raw sockets as one multiplexed socket
//! - [`stream`]: drive a socket into stdout/stderr sinks or streams

pub mod frame;
pub mod pack;
pub mod partition;
pub mod raw;
pub mod stream;

use std::io;
use std::sync::Arc;

use thiserror::Error;

pub use stream::{
    demux, demux_to_single_sink, merge_tagged, split, split_tagged, CombinedOutcome,
    DemuxOptions, DemuxOutcome, DemuxStreams, OutputStream, TaggedItem, TaggedStream,
    TaggedStreams,
};
pub use frame::{
    encode_frame, DecodeError, Frame, FrameDecoder, StreamChannel, HEADER_SIZE, MAX_FRAME_SIZE,
};
pub use partition::{partition, PartitionOutputs, PartitionStats, Partitioner};
pub use pack::{pack, PackedSocket};
pub use raw::{copy_raw, demux_raw_stdio, demux_raw_stdio_to_single_sink, RawStdio};

/// Demultiplexing errors
///
/// Cloneable so the same terminal error can end both output sequences.
#[derive(Clone, Debug, Error)]
pub enum DemuxError {
    /// The multiplexed stream was malformed or truncated
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Reading the socket or writing a sink failed
    #[error("{context}: {source}")]
    Io {
        /// What was being done
        context: &'static str,
        /// Underlying error
        source: Arc<io::Error>,
    },

    /// Stdin forwarding stopped because the output side finished first
    #[error("stdin forwarding cancelled: connection closed")]
    Cancelled,
}

impl DemuxError {
    pub(crate) fn io(context: &'static str, error: io::Error) -> Self {
        Self::Io {
            context,
            source: Arc::new(error),
        }
    }

    /// Whether this is a malformed-stream error
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}
