//! HTTP/1.1 connection hijack
//!
//! Sends one request asking the engine to upgrade the connection and hands
//! back the socket once the engine answers `101 Switching Protocols`. The
//! exchange runs over hyper's HTTP/1 client connection; bytes that arrived
//! with the response head are replayed by the upgraded socket before
//! anything else is read.

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1;
use hyper::ext::ReasonPhrase;
use hyper::upgrade::Upgraded;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use super::classify::{classify, ClassifyError, ResponseMetadata, StreamSocket};
use crate::transport::descriptor::PLACEHOLDER_HOST;

/// Largest response head accepted
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest error body read for the failure message
const MAX_ERROR_BODY: usize = 16 * 1024;

/// Socket handed back after a successful upgrade
pub type UpgradedChannel = TokioIo<Upgraded>;

/// Hijack handshake errors
#[derive(Debug, Error)]
pub enum HijackError {
    /// The engine closed the connection before the response was complete
    #[error("connection closed before the upgrade response completed")]
    Closed,

    /// The head exceeded [`MAX_HEAD_SIZE`]
    #[error("response head larger than {limit} bytes")]
    HeadTooLarge {
        /// The limit
        limit: usize,
    },

    /// The head could not be parsed
    #[error("malformed response head: {0}")]
    Malformed(String),

    /// The engine refused the upgrade
    #[error("engine answered {status} {reason}: {message}")]
    Status {
        /// HTTP status
        status: u16,
        /// Reason phrase
        reason: String,
        /// Error message from the response body
        message: String,
    },

    /// The request could not be built
    #[error("invalid upgrade request: {0}")]
    Request(#[from] hyper::http::Error),

    /// Request body could not be encoded
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),

    /// Any other HTTP or socket failure
    #[error("HTTP error during hijack: {0}")]
    Http(hyper::Error),

    /// The response is not a streaming socket
    #[error(transparent)]
    Classify(#[from] ClassifyError),
}

impl From<hyper::Error> for HijackError {
    fn from(error: hyper::Error) -> Self {
        if error.is_parse_too_large() {
            Self::HeadTooLarge {
                limit: MAX_HEAD_SIZE,
            }
        } else if error.is_parse() {
            Self::Malformed(error.to_string())
        } else if error.is_incomplete_message() || error.is_canceled() || error.is_closed() {
            Self::Closed
        } else {
            Self::Http(error)
        }
    }
}

/// A request that asks for the connection to be upgraded to a raw stream
#[derive(Clone, Debug)]
pub struct UpgradeRequest {
    method: Method,
    path: String,
    host: String,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
}

impl UpgradeRequest {
    /// `POST path` with no body
    ///
    /// `path` is the request target including query, e.g.
    /// `/v1.45/containers/abc/attach?stream=1&stdin=1&stdout=1&stderr=1`.
    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            host: PLACEHOLDER_HOST.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Override the `Host` header
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a JSON body
    pub fn with_json_body<T: Serialize>(mut self, body: &T) -> Result<Self, HijackError> {
        self.body = Some(Bytes::from(serde_json::to_vec(body)?));
        Ok(self)
    }

    fn to_http(&self) -> Result<Request<Full<Bytes>>, HijackError> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.path.as_str())
            .header(header::HOST, self.host.as_str())
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp");
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let body = match &self.body {
            Some(body) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                body.clone()
            }
            None => Bytes::new(),
        };
        let request = builder
            .header(header::CONTENT_LENGTH, body.len())
            .body(Full::new(body))?;
        Ok(request)
    }
}

/// Send `request` over `channel` and wait for the upgrade
///
/// Succeeds only on `101 Switching Protocols`. Any other status is a
/// [`HijackError::Status`] carrying the engine's error message when the
/// response has one.
pub async fn hijack<S>(
    channel: S,
    request: &UpgradeRequest,
) -> Result<(ResponseMetadata, UpgradedChannel), HijackError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let http_request = request.to_http()?;
    let (sender, conn) = http1::Builder::new()
        .title_case_headers(true)
        .allow_obsolete_multiline_headers_in_responses(true)
        .max_buf_size(MAX_HEAD_SIZE)
        .handshake::<_, Full<Bytes>>(TokioIo::new(channel))
        .await?;

    // The connection must be driven until it hands the socket over, and the
    // exchange outcome is what the caller sees.
    let conn = conn.with_upgrades();
    let exchange = exchange(sender, http_request);
    tokio::pin!(conn, exchange);
    let mut conn_done = false;
    loop {
        tokio::select! {
            result = &mut conn, if !conn_done => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Hijack connection ended with error");
                }
                conn_done = true;
            }
            result = &mut exchange => return result,
        }
    }
}

/// Hijack and classify in one step
pub async fn hijack_stream<S>(
    channel: S,
    request: &UpgradeRequest,
) -> Result<(ResponseMetadata, StreamSocket<UpgradedChannel>), HijackError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (metadata, socket) = hijack(channel, request).await?;
    let classified = classify(&metadata, socket)?;
    Ok((metadata, classified))
}

async fn exchange(
    mut sender: http1::SendRequest<Full<Bytes>>,
    request: Request<Full<Bytes>>,
) -> Result<(ResponseMetadata, UpgradedChannel), HijackError> {
    sender.ready().await?;
    let response = sender.send_request(request).await?;
    let metadata = response_metadata(&response);
    let status = response.status();

    if status != StatusCode::SWITCHING_PROTOCOLS {
        let reason = reason_phrase(&response);
        let message = if status.is_client_error() || status.is_server_error() {
            error_message(response.into_body()).await
        } else {
            "connection was not upgraded".to_string()
        };
        tracing::warn!(status = status.as_u16(), %message, "Engine refused hijack");
        return Err(HijackError::Status {
            status: status.as_u16(),
            reason,
            message,
        });
    }

    let upgraded = hyper::upgrade::on(response).await?;
    tracing::debug!(
        status = metadata.status,
        content_type = ?metadata.content_type(),
        "Connection hijacked"
    );
    Ok((metadata, TokioIo::new(upgraded)))
}

fn response_metadata(response: &Response<Incoming>) -> ResponseMetadata {
    let mut metadata = ResponseMetadata::new(response.status().as_u16());
    for (name, value) in response.headers() {
        metadata.headers.push((
            name.as_str().to_owned(),
            String::from_utf8_lossy(value.as_bytes()).trim().to_owned(),
        ));
    }
    metadata
}

fn reason_phrase(response: &Response<Incoming>) -> String {
    match response.extensions().get::<ReasonPhrase>() {
        Some(reason) => String::from_utf8_lossy(reason.as_bytes()).into_owned(),
        None => response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_owned(),
    }
}

/// The engine's `{"message": ...}` body, or the body text
async fn error_message(body: Incoming) -> String {
    #[derive(Deserialize)]
    struct EngineMessage {
        message: String,
    }

    let bytes = match Limited::new(body, MAX_ERROR_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::debug!(error = %e, "Failed to read error body");
            return "unreadable response body".to_string();
        }
    };
    if bytes.is_empty() {
        return "empty response body".to_string();
    }
    match serde_json::from_slice::<EngineMessage>(&bytes) {
        Ok(parsed) => parsed.message,
        Err(_) => String::from_utf8_lossy(&bytes).trim().to_owned(),
    }
}
