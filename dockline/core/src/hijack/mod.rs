//! Hijacked Connections
//!
//! After an attach/exec request the engine stops speaking HTTP on the
//! connection and turns it into a bidirectional process stream. This module
//! performs that handshake and tags the resulting socket with the protocol
//! it carries.

pub mod classify;
pub mod upgrade;

pub use classify::{
    classify, ClassifyError, ResponseMetadata, StreamKind, StreamSocket, MULTIPLEXED_CONTENT_TYPE,
    RAW_CONTENT_TYPE,
};
pub use upgrade::{
    hijack, hijack_stream, HijackError, UpgradeRequest, UpgradedChannel, MAX_HEAD_SIZE,
};
