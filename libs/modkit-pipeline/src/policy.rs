use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::request::Request;
use crate::response::Response;
use crate::transport::Transport;

/// One link of the request pipeline.
///
/// A policy may edit the request, forward it with [`Next::run`] (any number of
/// times), edit the response on the way back, or answer without forwarding.
///
/// ```ignore
/// struct ApiVersion(&'static str);
///
/// #[async_trait]
/// impl Policy for ApiVersion {
///     async fn send(&self, request: &mut Request, next: Next<'_>) -> Result<Response, PipelineError> {
///         request.url_mut().query_pairs_mut().append_pair("api-version", self.0);
///         next.run(request).await
///     }
/// }
/// ```
#[async_trait]
pub trait Policy: Send + Sync {
    async fn send(&self, request: &mut Request, next: Next<'_>) -> Result<Response, PipelineError>;
}

/// The remainder of the chain after the current policy.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    policies: &'a [Arc<dyn Policy>],
    transport: &'a dyn Transport,
}

impl<'a> Next<'a> {
    pub(crate) fn new(policies: &'a [Arc<dyn Policy>], transport: &'a dyn Transport) -> Self {
        Self {
            policies,
            transport,
        }
    }

    /// Forward `request` to the next policy, or to the transport at the end.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Canceled` without sending if the request's
    /// signal is already triggered, or as soon as it triggers while the
    /// transport call is in flight. Otherwise returns whatever the rest of the
    /// chain returns.
    pub async fn run(self, request: &mut Request) -> Result<Response, PipelineError> {
        if request.is_canceled() {
            return Err(PipelineError::Canceled);
        }

        match self.policies.split_first() {
            Some((policy, rest)) => {
                policy
                    .send(request, Next::new(rest, self.transport))
                    .await
            }
            None => {
                let token = request.cancellation_token().clone();
                tokio::select! {
                    biased;
                    () = token.cancelled() => Err(PipelineError::Canceled),
                    result = self.transport.send(request) => result,
                }
            }
        }
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining_policies", &self.policies.len())
            .finish_non_exhaustive()
    }
}

/// Sleep for `duration` unless `token` fires first.
///
/// # Errors
/// Returns `PipelineError::Canceled` if `token` fires before the sleep ends.
pub async fn sleep_or_cancel(
    duration: Duration,
    token: &CancellationToken,
) -> Result<(), PipelineError> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(PipelineError::Canceled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}
