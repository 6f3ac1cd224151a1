use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::time::Duration;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneSyncService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;
use url::Url;

use crate::config::{TransportConfig, TransportSecurity};
use crate::error::PipelineError;
use crate::request::Request;
use crate::response::{Response, ResponseBody};
use crate::tls;

/// Sends one fully built request and returns one response.
///
/// The last link of every pipeline. Implementations report network failures
/// as `PipelineError::Transport`/`Timeout` and return every HTTP status,
/// including 4xx/5xx, as `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &mut Request) -> Result<Response, PipelineError>;
}

type HyperService =
    BoxCloneSyncService<http::Request<Full<Bytes>>, http::Response<ResponseBody>, PipelineError>;

/// Default transport: pooled hyper client over rustls.
///
/// Layer stack (outer to inner): `Timeout → Decompression → hyper client`.
/// HTTP/1.1 and HTTP/2 are negotiated through ALPN. Cloning shares the
/// connection pool.
#[derive(Clone)]
pub struct HyperTransport {
    service: HyperService,
    security: TransportSecurity,
    max_body_size: usize,
}

impl HyperTransport {
    /// Build with [`TransportConfig::default()`].
    ///
    /// # Errors
    /// Returns `PipelineError::Tls` if TLS initialization fails.
    pub fn new() -> Result<Self, PipelineError> {
        Self::with_config(&TransportConfig::default())
    }

    /// Build from `config`.
    ///
    /// # Errors
    /// Returns `PipelineError::Tls` if TLS initialization fails (for example,
    /// native roots requested but the OS store is empty).
    pub fn with_config(config: &TransportConfig) -> Result<Self, PipelineError> {
        if config.security == TransportSecurity::AllowInsecureHttp {
            tracing::warn!("transport accepts plain http:// URLs; traffic is not encrypted");
        }

        let https = tls::https_connector(config.tls_roots, config.security)?;

        // pool_timer is required for pool_idle_timeout to take effect
        let mut client_builder = Client::builder(TokioExecutor::new());
        client_builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .http2_only(false);
        if let Some(idle_timeout) = config.pool_idle_timeout {
            client_builder.pool_idle_timeout(idle_timeout);
        }
        let client = client_builder.build::<_, Full<Bytes>>(https);

        let timeout = config.request_timeout;
        let service = ServiceBuilder::new()
            .layer(TimeoutLayer::new(timeout))
            .layer(DecompressionLayer::new())
            .service(client)
            .map_response(box_response_body)
            .map_err(move |e: tower::BoxError| map_tower_error(e, timeout));

        Ok(Self {
            service: BoxCloneSyncService::new(service),
            security: config.security,
            max_body_size: config.max_body_size,
        })
    }

    fn check_scheme(&self, url: &Url) -> Result<(), PipelineError> {
        match url.scheme() {
            "https" => Ok(()),
            "http" if self.security == TransportSecurity::AllowInsecureHttp => Ok(()),
            "http" => Err(PipelineError::InvalidScheme {
                scheme: "http".to_owned(),
                reason: "TlsOnly transport rejects plain http".to_owned(),
            }),
            other => Err(PipelineError::InvalidScheme {
                scheme: other.to_owned(),
                reason: "unsupported scheme".to_owned(),
            }),
        }
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("security", &self.security)
            .field("max_body_size", &self.max_body_size)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, request: &mut Request) -> Result<Response, PipelineError> {
        self.check_scheme(request.url())?;
        let wire = request.to_http()?;
        let response = self.service.clone().oneshot(wire).await?;
        Ok(Response::new(response, self.max_body_size))
    }
}

/// Map tower errors to `PipelineError`, keeping typed errors boxed by
/// inner layers.
fn map_tower_error(err: tower::BoxError, timeout: Duration) -> PipelineError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return PipelineError::Timeout(timeout);
    }

    match err.downcast::<PipelineError>() {
        Ok(err) => *err,
        Err(other) => PipelineError::Transport(other),
    }
}

fn box_response_body<B>(response: http::Response<B>) -> http::Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    http::Response::from_parts(parts, body.map_err(Into::into).boxed())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use http::{Method, StatusCode};
    use httpmock::prelude::*;
    use std::io::Write;

    fn transport() -> HyperTransport {
        HyperTransport::with_config(&TransportConfig::for_testing()).unwrap()
    }

    #[tokio::test]
    async fn test_sends_request_and_reads_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/items")
                    .header("content-type", "application/json")
                    .body(r#"{"name":"a"}"#);
                then.status(201).body(r#"{"id":"1"}"#);
            })
            .await;

        let mut request = Request::parse(Method::POST, &server.url("/items")).unwrap();
        request
            .set_json(&serde_json::json!({"name": "a"}))
            .unwrap();

        let response = transport().send(&mut request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let value: serde_json::Value = response.json().await.unwrap();
        assert_eq!(value["id"], "1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_is_ok_response() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing");
                then.status(404);
            })
            .await;

        let mut request = Request::parse(Method::GET, &server.url("/missing")).unwrap();
        let response = transport().send(&mut request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_gzip_body_is_decompressed() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello gzip").unwrap();
        let compressed = encoder.finish().unwrap();

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/gz");
                then.status(200)
                    .header("content-encoding", "gzip")
                    .body(compressed);
            })
            .await;

        let mut request = Request::parse(Method::GET, &server.url("/gz")).unwrap();
        let response = transport().send(&mut request).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "hello gzip");
    }

    #[tokio::test]
    async fn test_tls_only_rejects_http_url() {
        let transport = HyperTransport::new().unwrap();
        let mut request = Request::parse(Method::GET, "http://localhost:1/").unwrap();

        let err = transport.send(&mut request).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidScheme { ref scheme, .. } if scheme == "http"));
    }

    #[tokio::test]
    async fn test_unknown_scheme_rejected() {
        let mut request = Request::parse(Method::GET, "ftp://example.com/file").unwrap();
        let err = transport().send(&mut request).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidScheme { ref scheme, .. } if scheme == "ftp"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let mut request = Request::parse(Method::GET, "http://127.0.0.1:1/").unwrap();
        let err = transport().send(&mut request).await.unwrap_err();
        assert!(matches!(err, PipelineError::Transport(_)));
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slow");
                then.status(200).delay(Duration::from_secs(5));
            })
            .await;

        let config = TransportConfig {
            request_timeout: Duration::from_millis(100),
            ..TransportConfig::for_testing()
        };
        let transport = HyperTransport::with_config(&config).unwrap();
        let mut request = Request::parse(Method::GET, &server.url("/slow")).unwrap();

        let err = transport.send(&mut request).await.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(d) if d == Duration::from_millis(100)));
    }

    #[test]
    fn test_map_tower_error_preserves_pipeline_error() {
        let err: tower::BoxError = Box::new(PipelineError::Canceled);
        assert!(map_tower_error(err, Duration::from_secs(1)).is_canceled());
    }

    #[test]
    fn test_map_tower_error_wraps_unknown_as_transport() {
        let err: tower::BoxError = Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(matches!(
            map_tower_error(err, Duration::from_secs(1)),
            PipelineError::Transport(_)
        ));
    }
}
