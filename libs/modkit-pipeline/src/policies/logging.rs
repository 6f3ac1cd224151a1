use async_trait::async_trait;
use http::HeaderMap;
use std::collections::BTreeMap;
use tracing::Instrument;
use url::Url;

use crate::config::LoggingConfig;
use crate::error::PipelineError;
use crate::policy::{Next, Policy};
use crate::request::Request;
use crate::response::Response;

const REDACTED: &str = "REDACTED";

/// Wraps each call in an `outgoing_http` span and logs request/response
/// summaries at `debug`.
///
/// Span fields: `http.method`, `http.url` (scheme, authority and path only),
/// `otel.kind = "client"`, and on completion `http.status_code` and `error`
/// (set for 4xx/5xx and failures). Header and query values not allow-listed
/// in [`LoggingConfig`] are logged as `REDACTED`; sensitive header values are
/// always redacted.
#[derive(Clone, Debug, Default)]
pub struct LoggingPolicy {
    config: LoggingConfig,
}

impl LoggingPolicy {
    #[must_use]
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    fn redact_headers<'a>(&self, headers: &'a HeaderMap) -> BTreeMap<&'a str, &'a str> {
        headers
            .iter()
            .map(|(name, value)| {
                let shown = if value.is_sensitive() || !self.config.allowed_headers.contains(name)
                {
                    REDACTED
                } else {
                    value.to_str().unwrap_or(REDACTED)
                };
                (name.as_str(), shown)
            })
            .collect()
    }

    fn redact_query(&self, url: &Url) -> String {
        url.query_pairs()
            .map(|(key, value)| {
                if self.config.allowed_query_params.contains(key.as_ref()) {
                    format!("{key}={value}")
                } else {
                    format!("{key}={REDACTED}")
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

fn span_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}://{host}:{port}{}", url.scheme(), url.path()),
        None => format!("{}://{host}{}", url.scheme(), url.path()),
    }
}

#[async_trait]
impl Policy for LoggingPolicy {
    async fn send(&self, request: &mut Request, next: Next<'_>) -> Result<Response, PipelineError> {
        let span = tracing::info_span!(
            "outgoing_http",
            http.method = %request.method(),
            http.url = %span_url(request.url()),
            otel.kind = "client",
            http.status_code = tracing::field::Empty,
            error = tracing::field::Empty,
        );

        async {
            tracing::debug!(
                query = %self.redact_query(request.url()),
                headers = ?self.redact_headers(request.headers()),
                "sending request"
            );
            let started = tokio::time::Instant::now();

            let result = next.run(request).await;
            let elapsed_ms = started.elapsed().as_millis();

            match &result {
                Ok(response) => {
                    let status = response.status();
                    span.record("http.status_code", status.as_u16());
                    if status.is_client_error() || status.is_server_error() {
                        span.record("error", true);
                    }
                    tracing::debug!(
                        status = status.as_u16(),
                        elapsed_ms,
                        headers = ?self.redact_headers(response.headers()),
                        "received response"
                    );
                }
                Err(err) => {
                    span.record("error", true);
                    tracing::debug!(error = %err, elapsed_ms, "request failed");
                }
            }
            result
        }
        .instrument(span.clone())
        .await
    }
}
