use http::HeaderMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{PipelineConfig, RetryConfig};
use crate::error::PipelineError;
use crate::policies::{
    BearerTokenPolicy, HeadersPolicy, LoggingPolicy, RequestIdPolicy, RetryClassifier,
    RetryPolicy, TelemetryPolicy, TokenCredential,
};
use crate::policy::{Next, Policy};
use crate::request::Request;
use crate::response::Response;
use crate::transport::{HyperTransport, Transport};

/// Ordered, immutable policy chain ending in a transport.
///
/// Cloning is cheap and clones share the same policies. Any number of
/// concurrent [`send`](Pipeline::send) calls may run on one pipeline.
#[derive(Clone)]
pub struct Pipeline {
    policies: Arc<[Arc<dyn Policy>]>,
    transport: Arc<dyn Transport>,
}

impl Pipeline {
    /// Policies run in the given order; `transport` is the implicit last link.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, policies: Vec<Arc<dyn Policy>>) -> Self {
        Self {
            policies: policies.into(),
            transport,
        }
    }

    /// Run `request` through the chain on the calling task.
    ///
    /// # Errors
    ///
    /// Returns whatever the chain returns. A non-success status is not an
    /// error at this level: it comes back as an `Ok` response.
    pub async fn send(&self, request: &mut Request) -> Result<Response, PipelineError> {
        Next::new(&self.policies, self.transport.as_ref())
            .run(request)
            .await
    }

    #[must_use]
    pub fn policies(&self) -> &[Arc<dyn Policy>] {
        &self.policies
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("policies", &self.policies.len())
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Pipeline`] in the standard order:
///
/// `headers → per-call → telemetry → request id → logging → retry → per-retry → bearer → transport`
///
/// Per-call policies run once per [`Pipeline::send`]; per-retry policies and
/// the bearer policy run on every attempt. Use [`PipelineBuilder::into_policies`]
/// to take the assembled list and reorder it for [`Pipeline::new`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    default_headers: HeaderMap,
    per_call: Vec<Arc<dyn Policy>>,
    per_retry: Vec<Arc<dyn Policy>>,
    classifier: Option<Arc<dyn RetryClassifier>>,
    bearer: Option<Arc<BearerTokenPolicy>>,
    transport: Option<Arc<dyn Transport>>,
}

impl PipelineBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    /// Create a builder with a specific configuration
    #[must_use]
    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            config,
            default_headers: HeaderMap::new(),
            per_call: Vec::new(),
            per_retry: Vec::new(),
            classifier: None,
            bearer: None,
            transport: None,
        }
    }

    /// Set the user agent string
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Prefix the user agent with an application id
    #[must_use]
    pub fn application_id(mut self, application_id: impl Into<String>) -> Self {
        self.config.application_id = Some(application_id.into());
        self
    }

    /// Set the retry configuration (`None` removes the retry policy)
    #[must_use]
    pub fn retry(mut self, retry: Option<RetryConfig>) -> Self {
        self.config.retry = retry;
        self
    }

    /// Override the retry decision
    #[must_use]
    pub fn retry_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Headers set on every request unless overridden per call
    #[must_use]
    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    /// Add a policy that runs once per call, ahead of retry
    #[must_use]
    pub fn per_call(mut self, policy: Arc<dyn Policy>) -> Self {
        self.per_call.push(policy);
        self
    }

    /// Add a policy that runs on every attempt, after retry
    #[must_use]
    pub fn per_retry(mut self, policy: Arc<dyn Policy>) -> Self {
        self.per_retry.push(policy);
        self
    }

    /// Authenticate every attempt with a bearer token from `credential`
    #[must_use]
    pub fn bearer_token(
        mut self,
        credential: Arc<dyn TokenCredential>,
        scopes: Vec<String>,
    ) -> Self {
        self.bearer = Some(Arc::new(BearerTokenPolicy::new(credential, scopes)));
        self
    }

    /// Use `transport` instead of building a [`HyperTransport`]
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Allow insecure HTTP for the default transport (for testing only)
    ///
    /// **WARNING**: traffic is not encrypted. Only available in debug builds
    /// or with the `allow-insecure-http` feature.
    #[must_use]
    #[cfg(any(debug_assertions, feature = "allow-insecure-http"))]
    pub fn allow_insecure_http(mut self) -> Self {
        tracing::warn!(
            target: "modkit_pipeline::security",
            "allow_insecure_http() called - HTTP traffic will NOT be encrypted"
        );
        self.config.transport.security = crate::config::TransportSecurity::AllowInsecureHttp;
        self
    }

    /// Assemble the standard policy list without building a pipeline.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidHeaderValue` if the user agent is not a
    /// valid header value.
    pub fn into_policies(self) -> Result<Vec<Arc<dyn Policy>>, PipelineError> {
        let mut policies: Vec<Arc<dyn Policy>> =
            vec![Arc::new(HeadersPolicy::new(self.default_headers))];
        policies.extend(self.per_call);

        policies.push(Arc::new(TelemetryPolicy::try_new(
            &self.config.user_agent,
            self.config.application_id.as_deref(),
        )?));

        if self.config.request_id {
            policies.push(Arc::new(RequestIdPolicy::new()));
        }

        if let Some(logging) = self.config.logging {
            policies.push(Arc::new(LoggingPolicy::new(logging)));
        }

        if let Some(retry) = self.config.retry {
            let mut policy = RetryPolicy::new(retry);
            if let Some(classifier) = self.classifier {
                policy = policy.with_classifier(classifier);
            }
            policies.push(Arc::new(policy));
        }

        policies.extend(self.per_retry);

        if let Some(bearer) = self.bearer {
            policies.push(bearer);
        }

        Ok(policies)
    }

    /// Build the pipeline
    ///
    /// # Errors
    ///
    /// Returns an error if the user agent is invalid or the default transport
    /// cannot be built (TLS initialization).
    pub fn build(mut self) -> Result<Pipeline, PipelineError> {
        let transport: Arc<dyn Transport> = match self.transport.take() {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::with_config(&self.config.transport)?),
        };
        let policies = self.into_policies()?;
        Ok(Pipeline::new(transport, policies))
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::policies::{CLIENT_REQUEST_ID_HEADER, CustomHeaders};
    use crate::testing::ScriptedTransport;
    use async_trait::async_trait;
    use http::header::USER_AGENT;
    use http::{HeaderValue, Method, StatusCode};

    struct Recorder(&'static str);

    #[async_trait]
    impl Policy for Recorder {
        async fn send(
            &self,
            request: &mut Request,
            next: Next<'_>,
        ) -> Result<Response, PipelineError> {
            request.append_header("x-trail", self.0)?;
            next.run(request).await
        }
    }

    fn get() -> Request {
        Request::parse(Method::GET, "https://svc.example.com/items").unwrap()
    }

    #[tokio::test]
    async fn test_empty_pipeline_goes_straight_to_transport() {
        let transport = Arc::new(ScriptedTransport::new().status(StatusCode::OK));
        let pipeline = Pipeline::new(transport.clone(), Vec::new());

        let response = pipeline.send(&mut get()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.send_count(), 1);
    }

    #[tokio::test]
    async fn test_non_success_is_returned_as_response() {
        let transport = Arc::new(ScriptedTransport::new().status(StatusCode::CONFLICT));
        let pipeline = Pipeline::new(transport, Vec::new());

        let response = pipeline.send(&mut get()).await.unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_builder_applies_standard_policies() {
        let transport = Arc::new(ScriptedTransport::new().status(StatusCode::OK));
        let pipeline = PipelineBuilder::with_config(PipelineConfig::for_testing())
            .user_agent("svc-client/1.0")
            .application_id("my-app")
            .transport(transport.clone())
            .build()
            .unwrap();

        pipeline.send(&mut get()).await.unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.headers[USER_AGENT], "my-app svc-client/1.0");
        assert!(sent.headers.contains_key(CLIENT_REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn test_per_call_runs_once_per_retry_runs_every_attempt() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .status(StatusCode::OK),
        );
        let pipeline = PipelineBuilder::with_config(PipelineConfig::for_testing())
            .per_call(Arc::new(Recorder("call")))
            .per_retry(Arc::new(Recorder("try")))
            .transport(transport.clone())
            .build()
            .unwrap();

        let mut request = get();
        let response = pipeline.send(&mut request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        for attempt in &sent {
            let trail: Vec<_> = attempt.headers.get_all("x-trail").iter().collect();
            assert_eq!(trail, ["call", "try"]);
        }
    }

    #[tokio::test]
    async fn test_custom_headers_override_defaults() {
        let transport = Arc::new(ScriptedTransport::new().status(StatusCode::OK));
        let mut defaults = HeaderMap::new();
        defaults.insert("x-tenant", HeaderValue::from_static("default"));
        defaults.insert("x-region", HeaderValue::from_static("eu"));
        let pipeline = PipelineBuilder::with_config(PipelineConfig::minimal())
            .default_headers(defaults)
            .transport(transport.clone())
            .build()
            .unwrap();

        let mut request = get();
        let mut custom = HeaderMap::new();
        custom.insert("x-tenant", HeaderValue::from_static("t-42"));
        request.set_value::<CustomHeaders>(custom);
        pipeline.send(&mut request).await.unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.headers["x-tenant"], "t-42");
        assert_eq!(sent.headers["x-region"], "eu");
    }

    struct FixedCredential;

    #[async_trait]
    impl crate::policies::TokenCredential for FixedCredential {
        async fn get_token(
            &self,
            _scopes: &[String],
        ) -> Result<crate::policies::AccessToken, Box<dyn std::error::Error + Send + Sync>>
        {
            Ok(crate::policies::AccessToken::new(
                "tok",
                std::time::SystemTime::now() + std::time::Duration::from_secs(3600),
            ))
        }
    }

    struct RetryConflicts;

    impl RetryClassifier for RetryConflicts {
        fn classify(&self, outcome: Result<&Response, &PipelineError>) -> Option<bool> {
            match outcome {
                Ok(response) if response.status() == StatusCode::CONFLICT => Some(true),
                _ => None,
            }
        }
    }

    #[tokio::test]
    async fn test_classifier_and_bearer_apply_to_every_attempt() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .status(StatusCode::CONFLICT)
                .status(StatusCode::OK),
        );
        let pipeline = PipelineBuilder::with_config(PipelineConfig::for_testing())
            .retry_classifier(Arc::new(RetryConflicts))
            .bearer_token(Arc::new(FixedCredential), vec!["svc/.default".to_owned()])
            .transport(transport.clone())
            .build()
            .unwrap();

        let response = pipeline.send(&mut get()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        for attempt in &sent {
            assert_eq!(attempt.headers[http::header::AUTHORIZATION], "Bearer tok");
        }
    }

    #[test]
    fn test_into_policies_order() {
        let config = PipelineConfig::default();
        let with_everything = PipelineBuilder::with_config(config.clone())
            .per_call(Arc::new(Recorder("a")))
            .per_retry(Arc::new(Recorder("b")))
            .into_policies()
            .unwrap();
        // headers, per-call, telemetry, request id, logging, retry, per-retry
        assert_eq!(with_everything.len(), 7);

        let minimal = PipelineBuilder::with_config(PipelineConfig::minimal())
            .into_policies()
            .unwrap();
        // headers, telemetry
        assert_eq!(minimal.len(), 2);
    }

    #[test]
    fn test_invalid_user_agent_rejected() {
        let result = PipelineBuilder::with_config(PipelineConfig::minimal())
            .user_agent("bad\nagent")
            .into_policies();
        assert!(matches!(result, Err(PipelineError::InvalidHeaderValue(_))));
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_independent() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .status(StatusCode::OK)
                .status(StatusCode::OK),
        );
        let pipeline = PipelineBuilder::with_config(PipelineConfig::for_testing())
            .transport(transport.clone())
            .build()
            .unwrap();

        let mut a = get();
        let mut b = get();
        let (ra, rb) = tokio::join!(pipeline.send(&mut a), pipeline.send(&mut b));

        assert!(ra.is_ok() && rb.is_ok());
        let sent = transport.requests();
        assert_ne!(
            sent[0].headers[CLIENT_REQUEST_ID_HEADER],
            sent[1].headers[CLIENT_REQUEST_ID_HEADER]
        );
    }
}
