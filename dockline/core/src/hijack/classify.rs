//! Hijacked socket classification
//!
//! Decides once, from the response headers, whether the hijacked byte stream
//! is a raw PTY stream or the framed multiplexed protocol.

use std::fmt;

use thiserror::Error;

use crate::transport::BoxedChannel;

/// Content type of the framed stdin/stdout/stderr protocol
pub const MULTIPLEXED_CONTENT_TYPE: &str = "application/vnd.docker.multiplexed-stream";

/// Content type of an undifferentiated PTY stream
pub const RAW_CONTENT_TYPE: &str = "application/vnd.docker.raw-stream";

/// Status and headers of the response that hijacked the connection
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
    /// HTTP status code
    pub status: u16,
    /// Header fields in arrival order
    pub headers: Vec<(String, String)>,
}

impl ResponseMetadata {
    /// Metadata with a status and no headers
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The `Content-Type` header
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// Which protocol a hijacked socket speaks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Raw PTY bytes, stdout and stderr combined
    Raw,
    /// 8-byte-header frames tagged stdin/stdout/stderr
    Multiplexed,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str(RAW_CONTENT_TYPE),
            Self::Multiplexed => f.write_str(MULTIPLEXED_CONTENT_TYPE),
        }
    }
}

/// A hijacked socket tagged with its protocol
///
/// The tag is fixed at classification; downstream code dispatches on it.
#[derive(Debug)]
pub enum StreamSocket<S = BoxedChannel> {
    /// Raw PTY stream
    Raw(S),
    /// Multiplexed frame stream
    Multiplexed(S),
}

impl<S> StreamSocket<S> {
    /// The protocol tag
    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Raw(_) => StreamKind::Raw,
            Self::Multiplexed(_) => StreamKind::Multiplexed,
        }
    }

    /// The underlying socket
    pub fn into_inner(self) -> S {
        match self {
            Self::Raw(s) | Self::Multiplexed(s) => s,
        }
    }
}

/// The response was not a streaming hijack
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{reason}: {}", .observed.as_deref().unwrap_or("<absent>"))]
pub struct ClassifyError {
    /// Why classification failed
    pub reason: &'static str,
    /// The content type that was seen, if any
    pub observed: Option<String>,
}

/// Classify a hijacked socket by its response content type
///
/// The media type is compared without parameters and case-insensitively.
/// On error the socket is dropped, which closes it.
pub fn classify<S>(
    metadata: &ResponseMetadata,
    socket: S,
) -> Result<StreamSocket<S>, ClassifyError> {
    let observed = metadata.content_type();
    let media_type = observed
        .map(|v| v.split(';').next().unwrap_or("").trim())
        .unwrap_or("");

    let classified = if media_type.eq_ignore_ascii_case(MULTIPLEXED_CONTENT_TYPE) {
        StreamSocket::Multiplexed(socket)
    } else if media_type.eq_ignore_ascii_case(RAW_CONTENT_TYPE) {
        StreamSocket::Raw(socket)
    } else {
        tracing::debug!(content_type = ?observed, "Response is not a streaming socket");
        return Err(ClassifyError {
            reason: "unsupported content type",
            observed: observed.map(str::to_string),
        });
    };

    tracing::debug!(kind = %classified.kind(), "Classified hijacked socket");
    Ok(classified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn with_type(content_type: &str) -> ResponseMetadata {
        ResponseMetadata::new(101).with_header("Content-Type", content_type)
    }

    #[test]
    fn test_classify_multiplexed() {
        let socket = classify(&with_type(MULTIPLEXED_CONTENT_TYPE), ()).unwrap();
        assert_eq!(socket.kind(), StreamKind::Multiplexed);
    }

    #[test]
    fn test_classify_raw() {
        let socket = classify(&with_type(RAW_CONTENT_TYPE), ()).unwrap();
        assert_eq!(socket.kind(), StreamKind::Raw);
    }

    #[test]
    fn test_classify_ignores_case_and_parameters() {
        let meta = ResponseMetadata::new(200)
            .with_header("content-TYPE", "Application/Vnd.Docker.Raw-Stream; charset=utf-8");
        assert_eq!(classify(&meta, ()).unwrap().kind(), StreamKind::Raw);
    }

    #[test]
    fn test_classify_rejects_text_plain() {
        let err = classify(&with_type("text/plain"), ()).unwrap_err();
        assert_eq!(
            err,
            ClassifyError {
                reason: "unsupported content type",
                observed: Some("text/plain".into()),
            }
        );
        assert_eq!(err.to_string(), "unsupported content type: text/plain");
    }

    #[test]
    fn test_classify_rejects_missing_header() {
        let err = classify(&ResponseMetadata::new(101), ()).unwrap_err();
        assert_eq!(err.observed, None);
        assert_eq!(err.to_string(), "unsupported content type: <absent>");
    }
}
