use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use http_body_util::Full;
use serde::Serialize;
use std::io::Read;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::body::{BodySource, RequestBody};
use crate::error::PipelineError;
use crate::values::{OperationKey, OperationValues};

/// A single logical service call travelling through the pipeline.
///
/// Holds the method, absolute URL, headers, an optional replayable body, the
/// cancellation signal observed at every suspension point and a type-keyed bag
/// of per-call values.
///
/// # Example
///
/// ```ignore
/// use modkit_pipeline::{Request, RequestBody};
///
/// let mut request = Request::parse(http::Method::PUT, "https://svc.example.com/items/1")?;
/// request.insert_header("if-match", "*")?;
/// request.set_json(&Item { name: "a".into() })?;
///
/// let response = pipeline.send(&mut request).await?;
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<BodySource>,
    cancel: CancellationToken,
    values: OperationValues,
}

impl Request {
    /// Create a request with no body and a fresh cancellation signal.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            cancel: CancellationToken::new(),
            values: OperationValues::new(),
        }
    }

    /// Parse `url` and create a request.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidUrl` if `url` is not an absolute URL.
    pub fn parse(method: Method, url: &str) -> Result<Self, PipelineError> {
        Ok(Self::new(method, Url::parse(url)?))
    }

    /// Attach a caller-owned cancellation signal.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Set a header, replacing existing values of the same name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHeaderName`/`InvalidHeaderValue` for malformed input.
    pub fn insert_header(&mut self, name: &str, value: &str) -> Result<(), PipelineError> {
        let name = HeaderName::try_from(name)?;
        let value = HeaderValue::try_from(value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Append a header value, keeping existing values of the same name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHeaderName`/`InvalidHeaderValue` for malformed input.
    pub fn append_header(&mut self, name: &str, value: &str) -> Result<(), PipelineError> {
        let name = HeaderName::try_from(name)?;
        let value = HeaderValue::try_from(value)?;
        self.headers.append(name, value);
        Ok(())
    }

    /// Set a replayable body and its `Content-Type`/`Content-Length`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidArgument` for a [`RequestBody::Stream`]:
    /// a forward-only stream cannot be resent on retry. Use
    /// [`set_body_once`](Self::set_body_once) to opt into a single send.
    pub fn set_body(
        &mut self,
        body: impl Into<RequestBody>,
        content_type: &str,
    ) -> Result<(), PipelineError> {
        let body = BodySource::replayable(body.into())?;
        let length = body.content_length()?;
        self.install_body(body, content_type, length)
    }

    /// Set a forward-only body that can be sent exactly once.
    ///
    /// A retry after this body has been read fails with
    /// [`PipelineError::BodyNotReplayable`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidHeaderValue` if `content_type` is malformed.
    pub fn set_body_once(
        &mut self,
        reader: impl Read + Send + 'static,
        content_type: &str,
    ) -> Result<(), PipelineError> {
        self.install_body(BodySource::one_shot(Box::new(reader)), content_type, None)
    }

    /// Serialize `value` as the JSON body.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Json` if serialization fails.
    pub fn set_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec(value)?;
        self.set_body(bytes, "application/json")
    }

    fn install_body(
        &mut self,
        body: BodySource,
        content_type: &str,
        length: Option<u64>,
    ) -> Result<(), PipelineError> {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::try_from(content_type)?);
        match length {
            Some(len) => {
                self.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            }
            None => {
                self.headers.remove(CONTENT_LENGTH);
            }
        }
        self.body = Some(body);
        Ok(())
    }

    #[must_use]
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Whether the body (if any) can be sent more than once.
    #[must_use]
    pub fn is_replayable(&self) -> bool {
        self.body.as_ref().is_none_or(BodySource::is_replayable)
    }

    /// Reset the body to byte 0 for another attempt. No-op without a body.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::BodyNotReplayable` for a one-shot body that
    /// has already been read.
    pub fn rewind(&mut self) -> Result<(), PipelineError> {
        match &self.body {
            Some(body) => body.rewind(),
            None => Ok(()),
        }
    }

    /// Read the full body for sending. Empty when there is no body.
    ///
    /// # Errors
    ///
    /// Returns `BodyNotReplayable` for a consumed one-shot body and `Body`
    /// when the source fails to read.
    pub fn body_bytes(&self) -> Result<Bytes, PipelineError> {
        match &self.body {
            Some(body) => body.read_all(),
            None => Ok(Bytes::new()),
        }
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Independent copy observing `token`.
    ///
    /// Headers are cloned (cheap `HeaderValue` clones). Buffered and seekable
    /// bodies stay replayable on both copies. Operation values are cloned by
    /// value.
    #[must_use]
    pub fn clone_with(&self, token: CancellationToken) -> Self {
        Self {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            cancel: token,
            values: self.values.clone(),
        }
    }

    /// Store a per-call value under `K`.
    pub fn set_value<K: OperationKey>(&mut self, value: K::Value) -> Option<K::Value> {
        self.values.insert::<K>(value)
    }

    #[must_use]
    pub fn value<K: OperationKey>(&self) -> Option<&K::Value> {
        self.values.get::<K>()
    }

    #[must_use]
    pub fn values(&self) -> &OperationValues {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut OperationValues {
        &mut self.values
    }

    /// Build the wire request for one transport attempt.
    pub(crate) fn to_http(&self) -> Result<http::Request<Full<Bytes>>, PipelineError> {
        let uri: http::Uri = self
            .url
            .as_str()
            .parse()
            .map_err(|e: http::uri::InvalidUri| PipelineError::InvalidArgument(e.to_string()))?;

        let body = self.body_bytes()?;
        let mut request = http::Request::builder()
            .method(self.method.clone())
            .uri(uri)
            .body(Full::new(body))?;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}
