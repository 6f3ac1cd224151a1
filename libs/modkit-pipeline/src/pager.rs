use futures_util::{Stream, TryStreamExt, stream};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::de::{DeserializeOwned, Error as _};
use serde_json::Value;
use std::fmt;

use crate::error::PipelineError;
use crate::pipeline::Pipeline;
use crate::request::Request;

/// One decoded page: its items and the cursor to the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

/// Turns response headers and body into a [`Page`].
pub type PageDecoder<T> =
    Box<dyn Fn(&HeaderMap, &[u8]) -> Result<Page<T>, PipelineError> + Send + Sync>;

/// How the cursor of one page is turned into the request for the next.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContinuationStrategy {
    /// The cursor is a URL (absolute or relative) fetched with GET.
    #[default]
    NextLink,
    /// The initial request is resent with this query parameter set to the cursor.
    QueryParameter(String),
    /// The initial request is resent with this header set to the cursor.
    Header(String),
}

/// Field names of a JSON list response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPageFields {
    /// Array of items (default: `value`)
    pub items: String,
    /// Continuation cursor (default: `nextLink`)
    pub next: String,
}

impl Default for JsonPageFields {
    fn default() -> Self {
        Self {
            items: "value".to_owned(),
            next: "nextLink".to_owned(),
        }
    }
}

/// Lazy, cursor-driven sequence of pages.
///
/// Nothing is fetched until [`next_page`](Self::next_page) is called. Only the
/// current page is held; items are returned in server order.
///
/// ```ignore
/// let mut pager = Pager::<Widget>::json(pipeline, request);
/// while pager.more() {
///     for widget in pager.next_page().await? {
///         println!("{}", widget.name);
///     }
/// }
/// ```
pub struct Pager<T> {
    pipeline: Pipeline,
    template: Request,
    decoder: PageDecoder<T>,
    strategy: ContinuationStrategy,
    next: Option<String>,
    fetched: bool,
}

impl<T> Pager<T> {
    /// Page through the results of `request`, decoding each response with
    /// `decoder`.
    #[must_use]
    pub fn new(
        pipeline: Pipeline,
        request: Request,
        decoder: impl Fn(&HeaderMap, &[u8]) -> Result<Page<T>, PipelineError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            pipeline,
            template: request,
            decoder: Box::new(decoder),
            strategy: ContinuationStrategy::default(),
            next: None,
            fetched: false,
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: ContinuationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// `true` before the first fetch, then whether the last page had a cursor.
    #[must_use]
    pub fn more(&self) -> bool {
        !self.fetched || self.next.is_some()
    }

    /// Cursor returned with the last page.
    #[must_use]
    pub fn continuation(&self) -> Option<&str> {
        self.next.as_deref()
    }

    /// Fetch and decode the next page.
    ///
    /// On failure the pager is left as it was, so the call can be repeated.
    ///
    /// # Errors
    ///
    /// - `NoMorePages` once [`more`](Self::more) is `false`; no request is sent
    /// - `Response` for a non-2xx page response
    /// - any pipeline or decoder error
    pub async fn next_page(&mut self) -> Result<Vec<T>, PipelineError> {
        let mut request = if self.fetched {
            let cursor = self.next.as_deref().ok_or(PipelineError::NoMorePages)?;
            self.follow_up(cursor)?
        } else {
            self.template
                .clone_with(self.template.cancellation_token().clone())
        };

        let response = self
            .pipeline
            .send(&mut request)
            .await?
            .error_for_status()
            .await?;
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        let page = (self.decoder)(&headers, &body)?;

        self.fetched = true;
        self.next = page.next.filter(|cursor| !cursor.is_empty());
        tracing::debug!(
            items = page.items.len(),
            has_next = self.next.is_some(),
            "fetched page"
        );
        Ok(page.items)
    }

    fn follow_up(&self, cursor: &str) -> Result<Request, PipelineError> {
        let token = self.template.cancellation_token().clone();
        match &self.strategy {
            ContinuationStrategy::NextLink => {
                let url = self.template.url().join(cursor)?;
                let mut request = Request::new(Method::GET, url).with_cancellation(token);
                *request.headers_mut() = self.template.headers().clone();
                request.headers_mut().remove(CONTENT_TYPE);
                request.headers_mut().remove(CONTENT_LENGTH);
                *request.values_mut() = self.template.values().clone();
                Ok(request)
            }
            ContinuationStrategy::QueryParameter(name) => {
                let mut request = self.template.clone_with(token);
                let kept: Vec<(String, String)> = request
                    .url()
                    .query_pairs()
                    .filter(|(key, _)| key != name.as_str())
                    .map(|(key, value)| (key.into_owned(), value.into_owned()))
                    .collect();
                request
                    .url_mut()
                    .query_pairs_mut()
                    .clear()
                    .extend_pairs(kept)
                    .append_pair(name, cursor);
                Ok(request)
            }
            ContinuationStrategy::Header(name) => {
                let mut request = self.template.clone_with(token);
                request.headers_mut().insert(
                    HeaderName::from_bytes(name.as_bytes())?,
                    HeaderValue::from_str(cursor)?,
                );
                Ok(request)
            }
        }
    }

    /// Stream of pages, ending after the last page or the first error.
    pub fn into_pages(self) -> impl Stream<Item = Result<Vec<T>, PipelineError>> {
        stream::unfold(Some(self), |pager| async move {
            let mut pager = pager?;
            if !pager.more() {
                return None;
            }
            match pager.next_page().await {
                Ok(items) => Some((Ok(items), Some(pager))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Stream of items across all pages.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, PipelineError>> {
        self.into_pages()
            .map_ok(|items| stream::iter(items.into_iter().map(Ok::<T, PipelineError>)))
            .try_flatten()
    }
}

impl<T: DeserializeOwned + 'static> Pager<T> {
    /// Pager over `{"value": [...], "nextLink": "..."}` responses.
    #[must_use]
    pub fn json(pipeline: Pipeline, request: Request) -> Self {
        Self::json_with_fields(pipeline, request, JsonPageFields::default())
    }

    /// Pager over JSON list responses with custom field names.
    #[must_use]
    pub fn json_with_fields(pipeline: Pipeline, request: Request, fields: JsonPageFields) -> Self {
        Self::new(pipeline, request, move |_, body| decode_json_page(body, &fields))
    }
}

fn decode_json_page<T: DeserializeOwned>(
    body: &[u8],
    fields: &JsonPageFields,
) -> Result<Page<T>, PipelineError> {
    let mut value: Value = serde_json::from_slice(body)?;

    let items = match value.get_mut(fields.items.as_str()).map(Value::take) {
        None | Some(Value::Null) => Vec::new(),
        Some(items) => serde_json::from_value(items)?,
    };
    let next = match value.get(fields.next.as_str()) {
        None | Some(Value::Null) => None,
        Some(Value::String(cursor)) => Some(cursor.clone()),
        Some(_) => {
            return Err(serde_json::Error::custom(format!(
                "field `{}` is not a string",
                fields.next
            ))
            .into());
        }
    };
    Ok(Page { items, next })
}

impl<T> fmt::Debug for Pager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pager")
            .field("url", &self.template.url().as_str())
            .field("strategy", &self.strategy)
            .field("more", &self.more())
            .finish_non_exhaustive()
    }
}
