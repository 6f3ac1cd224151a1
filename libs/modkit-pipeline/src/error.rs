use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::poller::PollerStatus;

/// Bytes of an error body kept for the preview in messages and logs.
pub const ERROR_BODY_PREVIEW_LIMIT: usize = 8 * 1024;

/// Header carrying the service-specific error code on failed responses.
pub const ERROR_CODE_HEADER: &str = "x-ms-error-code";

/// A non-success response from the service.
///
/// Carries everything the caller needs to diagnose the failure: status,
/// headers, the raw body (bounded) and the service error code if one could be
/// extracted from the `x-ms-error-code` header or an `{"error": {"code": ..}}`
/// body.
#[derive(Clone)]
pub struct ResponseError {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    error_code: Option<String>,
}

impl ResponseError {
    /// Build from the parts of a consumed response.
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let error_code = extract_error_code(&headers, &body);
        Self {
            status,
            headers,
            body,
            error_code,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw response body as received.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Service error code, if the response carried one.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    /// Lossy UTF-8 preview of the body, truncated to [`ERROR_BODY_PREVIEW_LIMIT`].
    #[must_use]
    pub fn body_preview(&self) -> String {
        let end = self.body.len().min(ERROR_BODY_PREVIEW_LIMIT);
        String::from_utf8_lossy(&self.body[..end]).into_owned()
    }
}

impl fmt::Debug for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseError")
            .field("status", &self.status)
            .field("error_code", &self.error_code)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_code {
            Some(code) => write!(f, "HTTP {} ({code}): {}", self.status, self.body_preview()),
            None => write!(f, "HTTP {}: {}", self.status, self.body_preview()),
        }
    }
}

impl std::error::Error for ResponseError {}

fn extract_error_code(headers: &HeaderMap, body: &Bytes) -> Option<String> {
    if let Some(code) = headers
        .get(ERROR_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Some(code.to_owned());
    }

    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let error = value.get("error").unwrap_or(&value);
    error
        .get("code")
        .and_then(serde_json::Value::as_str)
        .map(ToOwned::to_owned)
}

/// Errors produced by the pipeline, poller and pager.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PipelineError {
    /// Network-level failure (connection refused, reset, DNS, ...)
    #[error("transport failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Single attempt timed out
    #[error("attempt exceeded its {0:?} deadline")]
    Timeout(Duration),

    /// Non-success response from the service
    #[error(transparent)]
    Response(Box<ResponseError>),

    /// Reading the request body source failed
    #[error("Failed to read request body: {0}")]
    Body(#[source] std::io::Error),

    /// The request body was consumed and cannot be sent again
    #[error("Request body cannot be rewound for another attempt")]
    BodyNotReplayable,

    /// The cancellation signal was triggered
    #[error("Operation canceled")]
    Canceled,

    /// Caller supplied an unusable value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The initial response carries none of the long-running-operation signals
    #[error("Unsupported long-running operation shape: {0}")]
    UnsupportedOperationShape(String),

    /// A status response could not be interpreted
    #[error("Invalid long-running operation state: {0}")]
    InvalidOperationState(String),

    /// Resume token was produced by an unknown runtime version
    #[error("Unsupported resume token version {0}")]
    UnsupportedTokenVersion(u32),

    /// Resume token could not be decoded
    #[error("Invalid resume token: {0}")]
    InvalidResumeToken(String),

    /// The long-running operation reached `Failed` or `Canceled`
    #[error("Long-running operation ended in state {status}: {error}")]
    OperationFailed {
        status: PollerStatus,
        error: Box<ResponseError>,
    },

    /// `next_page` called after the last page
    #[error("No more pages")]
    NoMorePages,

    /// Credential could not provide a token
    #[error("Credential error: {0}")]
    Credential(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// JSON (de)serialization failed
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bad header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    #[error("bad header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// URL scheme rejected by transport security configuration
    #[error("refusing '{scheme}' URL: {reason}")]
    InvalidScheme { scheme: String, reason: String },

    /// A buffered body grew past its configured cap.
    #[error("response body of {actual} bytes exceeds the {limit} byte cap")]
    BodyTooLarge { limit: usize, actual: usize },

    /// TLS setup failed
    #[error("TLS setup failed: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Building the wire request failed
    #[error("malformed request: {0}")]
    RequestBuild(#[from] http::Error),
}

impl PipelineError {
    /// Wrap a failed response.
    #[must_use]
    pub fn response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self::Response(Box::new(ResponseError::new(status, headers, body)))
    }

    /// Status code of the service response behind this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Response(err) => Some(err.status()),
            Self::OperationFailed { error, .. } => Some(error.status()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<ResponseError> for PipelineError {
    fn from(err: ResponseError) -> Self {
        Self::Response(Box::new(err))
    }
}

impl From<hyper::Error> for PipelineError {
    fn from(err: hyper::Error) -> Self {
        PipelineError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for PipelineError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PipelineError::Transport(Box::new(err))
    }
}
