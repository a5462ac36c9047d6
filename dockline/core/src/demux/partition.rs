//! Demultiplexing Partitioner
//!
//! Forks decoded frames into independent stdout and stderr sequences.
//!
//! Each output has its own bounded queue of `buffer_size` payloads. While
//! both consumers keep up, frames flow through immediately. When one
//! consumer stalls, its queue fills and delivery of its next frame suspends
//! the router until that consumer catches up. Payloads already queued for
//! the other output stay readable in the meantime, so one output never runs
//! more than `buffer_size` frames ahead of the other.

use tokio::sync::mpsc;

use super::frame::{Frame, StreamChannel};
use super::DemuxError;

/// Item carried by an output sequence
pub type OutputItem = Result<Vec<u8>, DemuxError>;

/// Frames routed so far per output
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PartitionStats {
    /// Frames delivered to the stdout queue
    pub stdout_frames: u64,
    /// Frames delivered to the stderr queue
    pub stderr_frames: u64,
    /// Frames dropped because their output was closed or was stdin
    pub discarded_frames: u64,
}

/// Receiving ends of the two output sequences
#[derive(Debug)]
pub struct PartitionOutputs {
    /// Stdout payloads in arrival order, then at most one error
    pub stdout: mpsc::Receiver<OutputItem>,
    /// Stderr payloads in arrival order, then at most one error
    pub stderr: mpsc::Receiver<OutputItem>,
}

/// Sending side owned by the socket reader
#[derive(Debug)]
pub struct Partitioner {
    stdout: Option<mpsc::Sender<OutputItem>>,
    stderr: Option<mpsc::Sender<OutputItem>>,
    stats: PartitionStats,
}

/// Create a partitioner with a lead bound of `buffer_size` frames
///
/// A `buffer_size` of zero is treated as one.
pub fn partition(buffer_size: usize) -> (Partitioner, PartitionOutputs) {
    let capacity = buffer_size.max(1);
    let (stdout_tx, stdout_rx) = mpsc::channel(capacity);
    let (stderr_tx, stderr_rx) = mpsc::channel(capacity);
    (
        Partitioner {
            stdout: Some(stdout_tx),
            stderr: Some(stderr_tx),
            stats: PartitionStats::default(),
        },
        PartitionOutputs {
            stdout: stdout_rx,
            stderr: stderr_rx,
        },
    )
}

impl Partitioner {
    /// Deliver one payload to its output, waiting while that output is full
    ///
    /// Returns `false` once neither output has a consumer left.
    pub async fn deliver(&mut self, frame: Frame) -> bool {
        let slot = match frame.channel {
            StreamChannel::Stdout => &mut self.stdout,
            StreamChannel::Stderr => &mut self.stderr,
            StreamChannel::Stdin => {
                tracing::debug!(len = frame.payload.len(), "Discarding stdin frame from engine");
                self.stats.discarded_frames += 1;
                return self.is_open();
            }
        };

        match slot {
            Some(tx) => {
                if tx.send(Ok(frame.payload)).await.is_err() {
                    tracing::debug!(channel = %frame.channel, "Output consumer went away");
                    *slot = None;
                    self.stats.discarded_frames += 1;
                } else {
                    match frame.channel {
                        StreamChannel::Stdout => self.stats.stdout_frames += 1,
                        _ => self.stats.stderr_frames += 1,
                    }
                }
            }
            None => self.stats.discarded_frames += 1,
        }
        self.is_open()
    }

    /// Whether any output still has a consumer
    pub fn is_open(&self) -> bool {
        self.stdout.is_some() || self.stderr.is_some()
    }

    /// Frames routed so far
    pub fn stats(&self) -> PartitionStats {
        self.stats
    }

    /// End both sequences successfully
    pub fn finish(self) -> PartitionStats {
        self.stats
    }

    /// End both sequences with `error`
    ///
    /// Payloads already queued stay in front of the error.
    pub async fn fail(self, error: DemuxError) -> PartitionStats {
        let send = |tx: Option<mpsc::Sender<OutputItem>>, error: DemuxError| async move {
            if let Some(tx) = tx {
                let _ = tx.send(Err(error)).await;
            }
        };
        tokio::join!(
            send(self.stdout, error.clone()),
            send(self.stderr, error)
        );
        self.stats
    }
}
