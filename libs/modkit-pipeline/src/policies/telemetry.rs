use async_trait::async_trait;
use http::HeaderValue;
use http::header::USER_AGENT;

use crate::error::PipelineError;
use crate::policy::{Next, Policy};
use crate::request::Request;
use crate::response::Response;

/// Stamps the `User-Agent` header, optionally prefixed with an application id.
///
/// A `User-Agent` already set by the caller is left alone.
#[derive(Clone, Debug)]
pub struct TelemetryPolicy {
    user_agent: HeaderValue,
}

impl TelemetryPolicy {
    /// # Errors
    /// Returns `PipelineError::InvalidHeaderValue` if the resulting value is
    /// not a valid header value.
    pub fn try_new(
        user_agent: impl AsRef<str>,
        application_id: Option<&str>,
    ) -> Result<Self, PipelineError> {
        let value = match application_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => format!("{id} {}", user_agent.as_ref()),
            None => user_agent.as_ref().to_owned(),
        };
        Ok(Self {
            user_agent: HeaderValue::try_from(value)?,
        })
    }

    #[must_use]
    pub fn user_agent(&self) -> &HeaderValue {
        &self.user_agent
    }
}

#[async_trait]
impl Policy for TelemetryPolicy {
    async fn send(&self, request: &mut Request, next: Next<'_>) -> Result<Response, PipelineError> {
        if !request.headers().contains_key(USER_AGENT) {
            request
                .headers_mut()
                .insert(USER_AGENT, self.user_agent.clone());
        }
        next.run(request).await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use http::{Method, StatusCode};
    use std::sync::Arc;

    async fn sent_user_agent(policy: TelemetryPolicy, preset: Option<&str>) -> String {
        let transport = ScriptedTransport::new().status(StatusCode::OK);
        let chain: Vec<Arc<dyn Policy>> = vec![Arc::new(policy)];
        let mut request = Request::parse(Method::GET, "https://svc.example.com/").unwrap();
        if let Some(ua) = preset {
            request.insert_header("user-agent", ua).unwrap();
        }
        Next::new(&chain, &transport).run(&mut request).await.unwrap();
        transport.requests()[0].headers[USER_AGENT]
            .to_str()
            .unwrap()
            .to_owned()
    }

    #[tokio::test]
    async fn test_adds_user_agent() {
        let policy = TelemetryPolicy::try_new("modkit-pipeline/1.0", None).unwrap();
        assert_eq!(sent_user_agent(policy, None).await, "modkit-pipeline/1.0");
    }

    #[tokio::test]
    async fn test_prefixes_application_id() {
        let policy = TelemetryPolicy::try_new("modkit-pipeline/1.0", Some("billing")).unwrap();
        assert_eq!(
            sent_user_agent(policy, None).await,
            "billing modkit-pipeline/1.0"
        );
    }

    #[tokio::test]
    async fn test_keeps_caller_user_agent() {
        let policy = TelemetryPolicy::try_new("modkit-pipeline/1.0", None).unwrap();
        assert_eq!(sent_user_agent(policy, Some("custom/2")).await, "custom/2");
    }

    #[test]
    fn test_rejects_invalid_value() {
        assert!(matches!(
            TelemetryPolicy::try_new("bad\x00agent", None),
            Err(PipelineError::InvalidHeaderValue(_))
        ));
    }
}
