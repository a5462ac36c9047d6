//! Multiplexed Frame Protocol
//!
//! Wire format of a hijacked connection carrying stdin, stdout and stderr.
//!
//! # Frame Format
//!
//! ```text
//! +---------+--------------+----------------+------------------------------+
//! | Tag (1) | Reserved (3) | Length (4)     | Payload (Length bytes)       |
//! | 0/1/2   | ignored      | big-endian u32 | raw process output           |
//! +---------+--------------+----------------+------------------------------+
//! ```
//!
//! Tag 0 is stdin, 1 stdout, 2 stderr. Any other tag is a decode error.
//! A zero-length payload is legal and yields an empty frame.
//!
//! The decoder is resumable: headers and payloads may be split across any
//! number of chunks, and one chunk may carry many frames.

use std::fmt;

use thiserror::Error;

/// Frame header size: 1 tag + 3 reserved + 4 length
pub const HEADER_SIZE: usize = 8;

/// Largest payload the decoder accepts by default: any length the 32-bit
/// header field can carry
///
/// Payload buffers grow as bytes arrive, so a large declared length does not
/// allocate up front.
pub const MAX_FRAME_SIZE: usize = u32::MAX as usize;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Largest up-front payload allocation; longer payloads grow as bytes arrive
const MAX_PREALLOC: usize = 64 * 1024;

/// Which process stream a frame belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamChannel {
    /// Process input
    Stdin,
    /// Process standard output
    Stdout,
    /// Process standard error
    Stderr,
}

impl StreamChannel {
    /// Wire tag for this channel
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }
}

impl TryFrom<u8> for StreamChannel {
    type Error = DecodeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Stdin),
            1 => Ok(Self::Stdout),
            2 => Ok(Self::Stderr),
            tag => Err(DecodeError::UnknownChannel { tag }),
        }
    }
}

impl fmt::Display for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => f.write_str("stdin"),
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// One decoded frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Stream the payload belongs to
    pub channel: StreamChannel,
    /// Payload bytes, exactly as long as the header declared
    pub payload: Vec<u8>,
}

/// Malformed multiplexed stream
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Header tag is not 0, 1 or 2
    #[error("unknown stream tag {tag}")]
    UnknownChannel {
        /// The tag byte
        tag: u8,
    },

    /// The stream ended inside a frame header
    #[error("stream ended after {received} of 8 header bytes")]
    TruncatedHeader {
        /// Header bytes received
        received: usize,
    },

    /// The stream ended inside a frame payload
    #[error("stream ended after {received} of {expected} payload bytes")]
    TruncatedPayload {
        /// Payload bytes received
        received: usize,
        /// Payload length declared by the header
        expected: usize,
    },

    /// Declared length exceeds the decoder limit
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared length
        len: usize,
        /// Configured limit
        max: usize,
    },
}

/// Encode one frame
///
/// # Errors
///
/// Returns `DecodeError::FrameTooLarge` if the payload does not fit the
/// 32-bit length field.
pub fn encode_frame(channel: StreamChannel, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| DecodeError::FrameTooLarge {
        len: payload.len(),
        max: MAX_FRAME_SIZE,
    })?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(channel.tag());
    buf.extend_from_slice(&[0, 0, 0]);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Where the decoder is inside the current frame
#[derive(Debug)]
enum DecodeState {
    AwaitingHeader {
        header: [u8; HEADER_SIZE],
        filled: usize,
    },
    AwaitingPayload {
        channel: StreamChannel,
        expected: usize,
        payload: Vec<u8>,
    },
}

impl DecodeState {
    fn header() -> Self {
        Self::AwaitingHeader {
            header: [0; HEADER_SIZE],
            filled: 0,
        }
    }
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete frames. Owned by a single
/// socket reader; never shared.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    state: DecodeState,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with the default frame limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a decoder rejecting payloads longer than `max_frame_size`
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            state: DecodeState::header(),
            max_frame_size,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos == self.buffer.len() {
            self.buffer.clear();
            self.read_pos = 0;
        } else if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of unconsumed bytes in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Whether the decoder sits between frames
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::AwaitingHeader { filled: 0, .. }) && self.available() == 0
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the header is invalid
    pub fn decode(&mut self) -> Result<Option<Frame>, DecodeError> {
        loop {
            match &mut self.state {
                DecodeState::AwaitingHeader { header, filled } => {
                    let take = (HEADER_SIZE - *filled).min(self.buffer.len() - self.read_pos);
                    header[*filled..*filled + take]
                        .copy_from_slice(&self.buffer[self.read_pos..self.read_pos + take]);
                    *filled += take;
                    self.read_pos += take;

                    if *filled < HEADER_SIZE {
                        return Ok(None);
                    }

                    let channel = StreamChannel::try_from(header[0])?;
                    let expected =
                        u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
                    if expected > self.max_frame_size {
                        return Err(DecodeError::FrameTooLarge {
                            len: expected,
                            max: self.max_frame_size,
                        });
                    }

                    self.state = DecodeState::AwaitingPayload {
                        channel,
                        expected,
                        payload: Vec::with_capacity(expected.min(MAX_PREALLOC)),
                    };
                }
                DecodeState::AwaitingPayload {
                    channel,
                    expected,
                    payload,
                } => {
                    let take = (*expected - payload.len()).min(self.buffer.len() - self.read_pos);
                    payload.extend_from_slice(&self.buffer[self.read_pos..self.read_pos + take]);
                    self.read_pos += take;

                    if payload.len() < *expected {
                        return Ok(None);
                    }

                    let frame = Frame {
                        channel: *channel,
                        payload: std::mem::take(payload),
                    };
                    self.state = DecodeState::header();
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Signal end of input
    ///
    /// Call after `decode` has returned `Ok(None)`. Ending between frames is
    /// a clean end of stream; ending inside a header or payload is an error.
    pub fn finish(&self) -> Result<(), DecodeError> {
        let pending = self.available();
        match &self.state {
            DecodeState::AwaitingHeader { filled, .. } if *filled + pending == 0 => Ok(()),
            DecodeState::AwaitingHeader { filled, .. } => Err(DecodeError::TruncatedHeader {
                received: *filled + pending,
            }),
            DecodeState::AwaitingPayload {
                expected, payload, ..
            } => Err(DecodeError::TruncatedPayload {
                received: payload.len() + pending,
                expected: *expected,
            }),
        }
    }

    /// Drop any partial frame and buffered bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
        self.state = DecodeState::header();
    }
}
