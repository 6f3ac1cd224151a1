use async_trait::async_trait;
use http::HeaderMap;

use crate::error::PipelineError;
use crate::policy::{Next, Policy};
use crate::request::Request;
use crate::response::Response;
use crate::values::OperationKey;

/// Per-call headers supplied through the request's operation values.
///
/// ```ignore
/// let mut extra = HeaderMap::new();
/// extra.insert("x-tenant", HeaderValue::from_static("t-1"));
/// request.set_value::<CustomHeaders>(extra);
/// ```
pub struct CustomHeaders;

impl OperationKey for CustomHeaders {
    type Value = HeaderMap;
}

/// Applies static default headers, then [`CustomHeaders`] from the request.
///
/// Defaults only fill names the request does not carry yet. Per-call headers
/// replace any existing values of the same name.
#[derive(Clone, Debug, Default)]
pub struct HeadersPolicy {
    defaults: HeaderMap,
}

impl HeadersPolicy {
    #[must_use]
    pub fn new(defaults: HeaderMap) -> Self {
        Self { defaults }
    }
}

fn fill_missing(target: &mut HeaderMap, source: &HeaderMap) {
    for name in source.keys() {
        if !target.contains_key(name) {
            for value in source.get_all(name) {
                target.append(name.clone(), value.clone());
            }
        }
    }
}

fn overwrite(target: &mut HeaderMap, source: &HeaderMap) {
    for name in source.keys() {
        target.remove(name);
        for value in source.get_all(name) {
            target.append(name.clone(), value.clone());
        }
    }
}

#[async_trait]
impl Policy for HeadersPolicy {
    async fn send(&self, request: &mut Request, next: Next<'_>) -> Result<Response, PipelineError> {
        if !self.defaults.is_empty() {
            fill_missing(request.headers_mut(), &self.defaults);
        }
        if let Some(custom) = request.values_mut().remove::<CustomHeaders>() {
            overwrite(request.headers_mut(), &custom);
            request.set_value::<CustomHeaders>(custom);
        }
        next.run(request).await
    }
}
