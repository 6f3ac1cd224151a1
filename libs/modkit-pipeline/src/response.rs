use crate::error::{ERROR_BODY_PREVIEW_LIMIT, PipelineError, ResponseError};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body::Frame;
use http_body_util::{BodyExt, Full};
use pin_project_lite::pin_project;
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

/// Default cap on buffered response bodies (10 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Millisecond retry hint headers, checked before `Retry-After`.
const RETRY_AFTER_MS_HEADERS: [&str; 2] = ["retry-after-ms", "x-ms-retry-after-ms"];

/// Parse a server retry hint into a `Duration`.
///
/// Checked in order:
/// - `retry-after-ms` / `x-ms-retry-after-ms`: milliseconds
/// - `Retry-After`: seconds ("120") or HTTP-date (RFC 1123)
///
/// Returns `None` if no header is present, no value parses, or the value is
/// negative (including an HTTP-date already in the past).
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);

    if let Some(ms) = RETRY_AFTER_MS_HEADERS
        .into_iter()
        .find_map(|name| header(name).and_then(non_negative))
    {
        return Some(Duration::from_millis(ms));
    }

    let retry_after = header(http::header::RETRY_AFTER.as_str())?;
    match retry_after.parse::<i64>() {
        Ok(seconds) => u64::try_from(seconds).ok().map(Duration::from_secs),
        Err(_) => until_http_date(retry_after),
    }
}

fn non_negative(value: &str) -> Option<u64> {
    value.parse::<i64>().ok().and_then(|n| u64::try_from(n).ok())
}

/// Time left until an HTTP-date; `None` if unparsable or already passed.
fn until_http_date(value: &str) -> Option<Duration> {
    let at = httpdate::parse_http_date(value).ok()?;
    at.duration_since(SystemTime::now()).ok()
}

/// Boxed response body, possibly decompressed by the transport.
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

pin_project! {
    /// Body wrapper that enforces a size limit while streaming.
    ///
    /// Created by [`Response::into_limited_body()`]. Yields
    /// [`PipelineError::BodyTooLarge`] once more than `limit` bytes were read.
    pub struct LimitedBody {
        #[pin]
        inner: ResponseBody,
        limit: usize,
        read: usize,
    }
}

impl LimitedBody {
    #[must_use]
    pub fn new(inner: ResponseBody, limit: usize) -> Self {
        Self {
            inner,
            limit,
            read: 0,
        }
    }

    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.read
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl http_body::Body for LimitedBody {
    type Data = Bytes;
    type Error = PipelineError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    *this.read += data.len();
                    if *this.read > *this.limit {
                        return Poll::Ready(Some(Err(PipelineError::BodyTooLarge {
                            limit: *this.limit,
                            actual: *this.read,
                        })));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(PipelineError::Transport(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A fully read response: status, headers and body bytes.
#[derive(Clone, Debug)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BufferedResponse {
    /// Convert into a [`ResponseError`] carrying all three parts.
    #[must_use]
    pub fn into_error(self) -> ResponseError {
        ResponseError::new(self.status, self.headers, self.body)
    }
}

/// A service response whose body is consumed exactly once.
///
/// Every body-reading method takes `self` by value. All buffered reads enforce
/// `max_body_size` on the decompressed bytes.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
    max_body_size: usize,
}

impl Response {
    /// Wrap a transport-level response.
    #[must_use]
    pub fn new(response: http::Response<ResponseBody>, max_body_size: usize) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            headers: parts.headers,
            body,
            max_body_size,
        }
    }

    /// Response backed by in-memory bytes.
    ///
    /// Used by transports that already hold the full body, and by fakes.
    #[must_use]
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: ResponseBody = Full::new(body.into())
            .map_err(|never| match never {})
            .boxed();
        Self {
            status,
            headers,
            body,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
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

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    #[must_use]
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Server retry hint carried by this response, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        parse_retry_after(&self.headers)
    }

    /// Read the body without a status check.
    ///
    /// # Errors
    /// Returns `PipelineError::BodyTooLarge` if the body exceeds the limit and
    /// `PipelineError::Transport` if the stream fails.
    pub async fn bytes(self) -> Result<Bytes, PipelineError> {
        read_body_limited(self.body, self.max_body_size).await
    }

    /// Read status, headers and body in one go, without a status check.
    ///
    /// # Errors
    /// Same as [`bytes()`](Self::bytes).
    pub async fn buffer(self) -> Result<BufferedResponse, PipelineError> {
        let body = read_body_limited(self.body, self.max_body_size).await?;
        Ok(BufferedResponse {
            status: self.status,
            headers: self.headers,
            body,
        })
    }

    /// Pass 2xx responses through, turn anything else into a `ResponseError`.
    ///
    /// The error body is read up to [`ERROR_BODY_PREVIEW_LIMIT`] so the
    /// service error code can be extracted.
    ///
    /// # Errors
    /// Returns `PipelineError::Response` for a non-2xx status.
    pub async fn error_for_status(self) -> Result<Self, PipelineError> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(self.into_error().await)
    }

    /// Consume a response known to be a failure into a `PipelineError`.
    pub async fn into_error(self) -> PipelineError {
        let status = self.status;
        let headers = self.headers;
        let limit = self.max_body_size.min(ERROR_BODY_PREVIEW_LIMIT);
        let body = match read_body_limited(self.body, limit).await {
            Ok(bytes) => bytes,
            Err(PipelineError::BodyTooLarge { .. }) => {
                Bytes::from_static(b"<body too large for preview>")
            }
            Err(e) => return e,
        };
        PipelineError::response(status, headers, body)
    }

    /// Read the body with a status check.
    ///
    /// # Errors
    /// Returns `PipelineError::Response` if status is not 2xx and
    /// `PipelineError::BodyTooLarge` if the body exceeds the limit.
    pub async fn checked_bytes(self) -> Result<Bytes, PipelineError> {
        self.error_for_status().await?.bytes().await
    }

    /// Decode the body as JSON with a status check.
    ///
    /// # Errors
    /// Returns `PipelineError::Response` if status is not 2xx and
    /// `PipelineError::Json` if decoding fails.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, PipelineError> {
        let bytes = self.checked_bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Read the body as lossy UTF-8 with a status check.
    ///
    /// # Errors
    /// Same as [`checked_bytes()`](Self::checked_bytes).
    pub async fn text(self) -> Result<String, PipelineError> {
        let bytes = self.checked_bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read and discard up to `limit` bytes so the connection can be reused.
    pub async fn drain(self, limit: usize) {
        let mut body = std::pin::pin!(self.body);
        let mut drained = 0usize;
        while let Some(Ok(frame)) = body.frame().await {
            if let Some(chunk) = frame.data_ref() {
                drained += chunk.len();
                if drained > limit {
                    break;
                }
            }
        }
    }

    /// Size-limited body stream for incremental processing.
    #[must_use]
    pub fn into_limited_body(self) -> LimitedBody {
        LimitedBody::new(self.body, self.max_body_size)
    }
}

/// Collect `body`, failing once more than `limit` decompressed bytes arrive.
///
/// # Errors
/// Returns `PipelineError::BodyTooLarge` past the limit and
/// `PipelineError::Transport` if the stream fails.
pub async fn read_body_limited(
    body: ResponseBody,
    limit: usize,
) -> Result<Bytes, PipelineError> {
    let mut collected = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(PipelineError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(PipelineError::BodyTooLarge {
                    limit,
                    actual: collected.len() + chunk.len(),
                });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}
