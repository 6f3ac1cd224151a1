//! Long-running operation poller.
//!
//! A [`Poller`] wraps the initial response of an operation the service runs
//! asynchronously. The operation kind is detected once, from the initial
//! response, and drives how every later poll response is read and where the
//! final result comes from.
//!
//! ```ignore
//! let response = pipeline.send(&mut request).await?;
//! let mut poller = Poller::<Widget>::new(pipeline.clone(), &request, response).await?;
//! let token = poller.resume_token()?; // persist to continue after a restart
//! let widget = poller.poll_until_done(Duration::from_secs(5), &cancel).await?;
//! ```

mod operation;
mod token;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use operation::{
    AZURE_ASYNC_OPERATION_HEADER, DEFAULT_DETECTION, Detection, FinalStateVia,
    OPERATION_LOCATION_HEADER, OperationKind,
};
pub use token::TOKEN_VERSION;

use operation::{FinalResult, PollFailure};
use token::PollState;

use crate::error::{PipelineError, ResponseError};
use crate::pipeline::Pipeline;
use crate::policy::sleep_or_cancel;
use crate::request::Request;
use crate::response::{BufferedResponse, Response, parse_retry_after};
use crate::values::OperationKey;

/// State of a long-running operation.
///
/// `Succeeded`, `Failed` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PollerStatus {
    /// No status observed yet.
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl PollerStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Map a service status string, ignoring case.
    ///
    /// `Succeeded`, `Failed` and `Canceled` (or `Cancelled`) are terminal,
    /// any other non-empty value means the operation is still running. Returns
    /// `None` for an empty string.
    #[must_use]
    pub fn from_wire(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            None
        } else if raw.eq_ignore_ascii_case("succeeded") {
            Some(Self::Succeeded)
        } else if raw.eq_ignore_ascii_case("failed") {
            Some(Self::Failed)
        } else if raw.eq_ignore_ascii_case("canceled") || raw.eq_ignore_ascii_case("cancelled") {
            Some(Self::Canceled)
        } else {
            Some(Self::InProgress)
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::InProgress => "InProgress",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for PollerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-operation poller settings.
///
/// Can be passed explicitly to [`Poller::with_options`] or attached to the
/// initiating request as an operation value, where [`Poller::new`] picks it up.
#[derive(Debug, Clone)]
pub struct PollerOptions {
    /// Detection precedence, first present signal wins
    pub detection: Vec<Detection>,
    /// Override for where the final result is fetched
    pub final_state_via: Option<FinalStateVia>,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            detection: DEFAULT_DETECTION.to_vec(),
            final_state_via: None,
        }
    }
}

impl OperationKey for PollerOptions {
    type Value = Self;
}

/// Tracks one long-running operation to completion.
///
/// Owned by a single caller. Every `poll` takes its own cancellation token,
/// so abandoning one wait leaves the poller usable and resumable.
pub struct Poller<T> {
    pipeline: Pipeline,
    state: PollState,
    last_body: Option<Bytes>,
    failure: Option<ResponseError>,
    retry_after: Option<Duration>,
    result_type: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Poller<T> {
    /// Start tracking the operation begun by `request`.
    ///
    /// Uses the [`PollerOptions`] stored on the request, or the defaults.
    ///
    /// # Errors
    ///
    /// See [`with_options`](Self::with_options).
    pub async fn new(
        pipeline: Pipeline,
        request: &Request,
        response: Response,
    ) -> Result<Self, PipelineError> {
        let options = request.value::<PollerOptions>().cloned().unwrap_or_default();
        Self::with_options(pipeline, request, response, &options).await
    }

    /// Start tracking the operation begun by `request` with explicit options.
    ///
    /// # Errors
    ///
    /// - `PipelineError::Response` if the initial status is not 200, 201, 202 or 204
    /// - `PipelineError::UnsupportedOperationShape` if no detection signal is present
    /// - `PipelineError::InvalidOperationState` if a signal is present but unusable
    pub async fn with_options(
        pipeline: Pipeline,
        request: &Request,
        response: Response,
        options: &PollerOptions,
    ) -> Result<Self, PipelineError> {
        if !matches!(
            response.status(),
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED | StatusCode::NO_CONTENT
        ) {
            return Err(response.into_error().await);
        }

        let initial = response.buffer().await?;
        let detected = operation::detect(&options.detection, request.url(), &initial)?;

        let state = PollState {
            kind: detected.kind,
            method: request.method().as_str().to_owned(),
            original_url: request.url().clone(),
            polling_url: detected.polling_url,
            status: detected.status,
            location_url: detected.location_url,
            resource_location: None,
            final_state_via: options.final_state_via,
            latest_status_code: Some(initial.status.as_u16()),
            fatal: None,
        };
        tracing::debug!(
            kind = ?state.kind,
            polling_url = %state.polling_url,
            status = %state.status,
            "long-running operation started"
        );

        let failure = matches!(state.status, PollerStatus::Failed | PollerStatus::Canceled)
            .then(|| initial.clone().into_error());
        Ok(Self {
            pipeline,
            state,
            last_body: Some(initial.body),
            failure,
            retry_after: None,
            result_type: PhantomData,
        })
    }

    /// Rebuild a poller from [`resume_token`](Self::resume_token) output.
    ///
    /// Issues no request. A token taken after completion yields a poller that
    /// is already in that terminal state, and one taken after an unreadable
    /// status response keeps failing with `InvalidOperationState`.
    ///
    /// # Errors
    ///
    /// `UnsupportedTokenVersion` for a token of another version and
    /// `InvalidResumeToken` for anything unreadable.
    pub fn from_resume_token(token: &str, pipeline: Pipeline) -> Result<Self, PipelineError> {
        let state = token::decode(token)?;
        Method::from_bytes(state.method.as_bytes())
            .map_err(|e| PipelineError::InvalidResumeToken(format!("invalid method: {e}")))?;

        Ok(Self {
            pipeline,
            state,
            last_body: None,
            failure: None,
            retry_after: None,
            result_type: PhantomData,
        })
    }

    /// Opaque, versioned snapshot of the poll state.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Json` if the state cannot be serialized.
    pub fn resume_token(&self) -> Result<String, PipelineError> {
        token::encode(&self.state)
    }

    #[must_use]
    pub fn status(&self) -> PollerStatus {
        self.state.status
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.status.is_terminal()
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.state.kind
    }

    #[must_use]
    pub fn polling_url(&self) -> &Url {
        &self.state.polling_url
    }

    /// Status code of the most recent response seen by this poller.
    #[must_use]
    pub fn latest_response_status(&self) -> Option<StatusCode> {
        self.state
            .latest_status_code
            .and_then(|code| StatusCode::from_u16(code).ok())
    }

    /// Issue one status request and advance the state.
    ///
    /// A poller in a terminal state returns that state without a request.
    ///
    /// # Errors
    ///
    /// - `InvalidOperationState` if the status response cannot be read. This
    ///   is permanent: every later call returns it again.
    /// - `Canceled` if `cancel` fires first.
    /// - any pipeline error of the status request itself.
    pub async fn poll(&mut self, cancel: &CancellationToken) -> Result<PollerStatus, PipelineError> {
        if let Some(reason) = &self.state.fatal {
            return Err(PipelineError::InvalidOperationState(reason.clone()));
        }
        if self.state.status.is_terminal() {
            return Ok(self.state.status);
        }

        let response = self.get(self.state.polling_url.clone(), cancel).await?;
        self.state.latest_status_code = Some(response.status.as_u16());
        self.retry_after = parse_retry_after(&response.headers);

        let observed = match self.state.kind.interpret(&response, &self.state.polling_url) {
            Ok(observed) => observed,
            Err(PollFailure::Fatal(reason)) => {
                tracing::debug!(
                    polling_url = %self.state.polling_url,
                    reason = %reason,
                    "long-running operation state unreadable, polling stopped"
                );
                self.state.fatal = Some(reason.clone());
                return Err(PipelineError::InvalidOperationState(reason));
            }
            Err(PollFailure::Response(err)) => return Err(err.into()),
        };

        let previous = self.state.status;
        if let Some(url) = observed.next_url {
            self.state.polling_url = url;
        }
        if observed.resource_location.is_some() {
            self.state.resource_location = observed.resource_location;
        }
        self.state.status = observed.status;
        if matches!(observed.status, PollerStatus::Failed | PollerStatus::Canceled) {
            self.failure = Some(response.clone().into_error());
        }
        self.last_body = Some(response.body);

        if previous != observed.status {
            tracing::debug!(
                from = %previous,
                to = %observed.status,
                polling_url = %self.state.polling_url,
                "long-running operation status changed"
            );
        }
        Ok(observed.status)
    }

    /// Poll until the operation finishes, then return its result.
    ///
    /// Waits `frequency` between polls unless the last status response carried
    /// a retry hint, which takes precedence.
    ///
    /// # Errors
    ///
    /// - `OperationFailed` when the operation ends `Failed` or `Canceled`
    /// - `Canceled` if `cancel` fires during a poll or a wait
    /// - any error from [`poll`](Self::poll) or [`result`](Self::result)
    pub async fn poll_until_done(
        &mut self,
        frequency: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, PipelineError> {
        loop {
            if self.poll(cancel).await?.is_terminal() {
                return self.result(cancel).await;
            }
            let delay = self.retry_after.unwrap_or(frequency);
            sleep_or_cancel(delay, cancel).await?;
        }
    }

    /// Decode the result of a finished operation.
    ///
    /// Depending on the operation kind and method this is the last poll body
    /// or the body of one final GET.
    ///
    /// # Errors
    ///
    /// - `OperationFailed` for a `Failed` or `Canceled` operation
    /// - `InvalidArgument` while the operation is still running
    /// - `Response` if the final GET is rejected, `Json` if decoding fails
    pub async fn result(&mut self, cancel: &CancellationToken) -> Result<T, PipelineError> {
        if let Some(reason) = &self.state.fatal {
            return Err(PipelineError::InvalidOperationState(reason.clone()));
        }
        match self.state.status {
            PollerStatus::Succeeded => {}
            status @ (PollerStatus::Failed | PollerStatus::Canceled) => {
                return Err(PipelineError::OperationFailed {
                    status,
                    error: Box::new(self.failure()),
                });
            }
            PollerStatus::NotStarted | PollerStatus::InProgress => {
                return Err(PipelineError::InvalidArgument(
                    "long-running operation has not finished".to_owned(),
                ));
            }
        }

        let method = Method::from_bytes(self.state.method.as_bytes())
            .map_err(|e| PipelineError::InvalidOperationState(format!("invalid method: {e}")))?;
        let source = self.state.kind.final_result(
            &method,
            &self.state.original_url,
            self.state.location_url.as_ref(),
            self.state.resource_location.as_ref(),
            self.state.final_state_via,
        );

        let body = match (source, &self.last_body) {
            (FinalResult::Get(url), _) => self.fetch_result(url, cancel).await?,
            (FinalResult::LastPoll, Some(body)) => body.clone(),
            (FinalResult::LastPoll, None) => {
                self.fetch_result(self.state.polling_url.clone(), cancel)
                    .await?
            }
        };
        decode_result(&body)
    }

    fn failure(&self) -> ResponseError {
        self.failure.clone().unwrap_or_else(|| {
            ResponseError::new(
                self.latest_response_status().unwrap_or(StatusCode::OK),
                HeaderMap::new(),
                Bytes::new(),
            )
        })
    }

    async fn get(
        &self,
        url: Url,
        cancel: &CancellationToken,
    ) -> Result<BufferedResponse, PipelineError> {
        let mut request = Request::new(Method::GET, url).with_cancellation(cancel.clone());
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PipelineError::Canceled),
            result = async {
                self.pipeline.send(&mut request).await?.buffer().await
            } => result,
        }
    }

    async fn fetch_result(
        &self,
        url: Url,
        cancel: &CancellationToken,
    ) -> Result<Bytes, PipelineError> {
        let response = self.get(url, cancel).await?;
        if !response.status.is_success() {
            return Err(response.into_error().into());
        }
        Ok(response.body)
    }
}

fn decode_result<T: DeserializeOwned>(body: &[u8]) -> Result<T, PipelineError> {
    let body = if body.is_empty() { b"null".as_slice() } else { body };
    Ok(serde_json::from_slice(body)?)
}

impl<T> fmt::Debug for Poller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("kind", &self.state.kind)
            .field("status", &self.state.status)
            .field("polling_url", &self.state.polling_url.as_str())
            .finish_non_exhaustive()
    }
}
