use async_trait::async_trait;
use http::{HeaderName, HeaderValue};

use crate::error::PipelineError;
use crate::policy::{Next, Policy};
use crate::request::Request;
use crate::response::Response;

/// Header carrying the client-generated request id.
pub const CLIENT_REQUEST_ID_HEADER: &str = "x-ms-client-request-id";

/// Sets a random UUID v4 client request id unless one is already present.
///
/// Runs ahead of the retry policy, so all attempts of one call share the id.
#[derive(Clone, Debug, Default)]
pub struct RequestIdPolicy;

impl RequestIdPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Policy for RequestIdPolicy {
    async fn send(&self, request: &mut Request, next: Next<'_>) -> Result<Response, PipelineError> {
        if !request.headers().contains_key(CLIENT_REQUEST_ID_HEADER) {
            let id = uuid::Uuid::new_v4().hyphenated().to_string();
            request
                .headers_mut()
                .insert(
                    HeaderName::from_static(CLIENT_REQUEST_ID_HEADER),
                    HeaderValue::try_from(id)?,
                );
        }
        next.run(request).await
    }
}
