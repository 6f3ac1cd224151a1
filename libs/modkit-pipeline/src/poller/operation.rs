//! Operation kinds: how an operation is detected, how a poll response is read
//! and where the final result comes from.

use http::header::LOCATION;
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::PollerStatus;
use crate::error::{PipelineError, ResponseError};
use crate::response::BufferedResponse;

pub const AZURE_ASYNC_OPERATION_HEADER: &str = "azure-asyncoperation";
pub const OPERATION_LOCATION_HEADER: &str = "operation-location";

const STATUS_POINTER: &str = "/status";
const PROVISIONING_STATE_POINTER: &str = "/properties/provisioningState";
const RESOURCE_LOCATION_POINTER: &str = "/resourceLocation";

/// Signal in an initial response that marks a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Detection {
    /// `Azure-AsyncOperation` or `Operation-Location` header
    StatusMonitor,
    /// `Location` header
    Location,
    /// `properties.provisioningState` in the response body
    Body,
}

/// Default detection precedence.
pub const DEFAULT_DETECTION: [Detection; 3] =
    [Detection::StatusMonitor, Detection::Location, Detection::Body];

/// Where the final GET of a succeeded operation goes, overriding the
/// per-kind default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalStateVia {
    AzureAsyncOperation,
    Location,
    OriginalUri,
    OperationLocation,
}

/// Shape of a long-running operation, chosen once from the initial response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    /// Poll a status resource whose body carries `status`.
    StatusMonitor,
    /// Poll the `Location` URL until it stops answering 202.
    Location,
    /// Poll the resource itself and read `properties.provisioningState`.
    Body,
}

/// Source of the final result once an operation has succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResult {
    /// The last poll response body is the result.
    LastPoll,
    /// Issue a GET against this URL.
    Get(Url),
}

/// Kind and first polling target extracted from an initial response.
#[derive(Debug, Clone)]
pub struct Detected {
    pub kind: OperationKind,
    pub polling_url: Url,
    pub status: PollerStatus,
    pub location_url: Option<Url>,
}

/// What one successful poll response says about the operation.
#[derive(Debug, Clone)]
pub struct Observed {
    pub status: PollerStatus,
    pub next_url: Option<Url>,
    pub resource_location: Option<Url>,
}

/// Why a poll response could not be turned into an [`Observed`].
#[derive(Debug)]
pub enum PollFailure {
    /// The response cannot be interpreted. Polling must stop.
    Fatal(String),
    /// The status endpoint answered with a non-success status.
    Response(ResponseError),
}

/// Pick the operation kind using `order`, first match wins.
///
/// # Errors
///
/// `UnsupportedOperationShape` when no signal in `order` is present, and
/// `InvalidOperationState` when a signal is present but unusable.
pub fn detect(
    order: &[Detection],
    original_url: &Url,
    initial: &BufferedResponse,
) -> Result<Detected, PipelineError> {
    // A broken Location only matters when it is the signal being used.
    let location = header_url(&initial.headers, LOCATION.as_str(), original_url);
    let location_url = location.clone().ok().flatten();

    for detection in order {
        match detection {
            Detection::StatusMonitor => {
                if let Some(url) = status_monitor_url(&initial.headers, original_url)
                    .map_err(PipelineError::InvalidOperationState)?
                {
                    return Ok(Detected {
                        kind: OperationKind::StatusMonitor,
                        polling_url: url,
                        status: PollerStatus::NotStarted,
                        location_url,
                    });
                }
            }
            Detection::Location => {
                let url = location
                    .clone()
                    .map_err(PipelineError::InvalidOperationState)?;
                if let Some(url) = url {
                    return Ok(Detected {
                        kind: OperationKind::Location,
                        polling_url: url.clone(),
                        status: PollerStatus::NotStarted,
                        location_url: Some(url),
                    });
                }
            }
            Detection::Body => {
                let Ok(value) = serde_json::from_slice::<Value>(&initial.body) else {
                    continue;
                };
                if let Some(status) = status_field(&value, PROVISIONING_STATE_POINTER)
                    .map_err(PipelineError::InvalidOperationState)?
                {
                    return Ok(Detected {
                        kind: OperationKind::Body,
                        polling_url: original_url.clone(),
                        status,
                        location_url,
                    });
                }
            }
        }
    }

    Err(PipelineError::UnsupportedOperationShape(format!(
        "initial {} response carries no long-running operation signal",
        initial.status.as_u16()
    )))
}

impl OperationKind {
    /// Read one poll response. `base` resolves relative URLs.
    ///
    /// # Errors
    ///
    /// [`PollFailure::Fatal`] for a malformed or missing status, and
    /// [`PollFailure::Response`] for a non-success status on a kind whose
    /// status endpoint must answer 2xx.
    pub fn interpret(
        self,
        response: &BufferedResponse,
        base: &Url,
    ) -> Result<Observed, PollFailure> {
        match self {
            Self::StatusMonitor => interpret_status_monitor(response, base),
            Self::Location => interpret_location(response, base),
            Self::Body => interpret_body(response),
        }
    }

    /// Where the result of a succeeded operation is read from.
    #[must_use]
    pub fn final_result(
        self,
        method: &Method,
        original_url: &Url,
        location_url: Option<&Url>,
        resource_location: Option<&Url>,
        via: Option<FinalStateVia>,
    ) -> FinalResult {
        match via {
            Some(FinalStateVia::OriginalUri) => return FinalResult::Get(original_url.clone()),
            Some(FinalStateVia::Location) => {
                if let Some(url) = location_url {
                    return FinalResult::Get(url.clone());
                }
            }
            Some(FinalStateVia::AzureAsyncOperation | FinalStateVia::OperationLocation) => {
                return FinalResult::LastPoll;
            }
            None => {}
        }

        let put_or_patch = *method == Method::PUT || *method == Method::PATCH;
        match self {
            Self::StatusMonitor => {
                if let Some(url) = resource_location {
                    FinalResult::Get(url.clone())
                } else if put_or_patch {
                    FinalResult::Get(original_url.clone())
                } else if let (true, Some(url)) = (*method == Method::POST, location_url) {
                    FinalResult::Get(url.clone())
                } else {
                    FinalResult::LastPoll
                }
            }
            Self::Location if put_or_patch => FinalResult::Get(original_url.clone()),
            Self::Location | Self::Body => FinalResult::LastPoll,
        }
    }
}

fn interpret_status_monitor(
    response: &BufferedResponse,
    base: &Url,
) -> Result<Observed, PollFailure> {
    if !response.status.is_success() {
        return Err(PollFailure::Response(response.clone().into_error()));
    }
    let value = parse_body(&response.body).map_err(PollFailure::Fatal)?;
    let status = status_field(&value, STATUS_POINTER)
        .map_err(PollFailure::Fatal)?
        .ok_or_else(|| PollFailure::Fatal("status monitor response has no status field".to_owned()))?;
    let resource_location = match value.pointer(RESOURCE_LOCATION_POINTER) {
        Some(Value::String(raw)) if !raw.is_empty() => Some(
            base.join(raw)
                .map_err(|e| PollFailure::Fatal(format!("invalid resourceLocation: {e}")))?,
        ),
        _ => None,
    };
    let next_url = status_monitor_url(&response.headers, base).map_err(PollFailure::Fatal)?;
    Ok(Observed {
        status,
        next_url,
        resource_location,
    })
}

fn interpret_location(response: &BufferedResponse, base: &Url) -> Result<Observed, PollFailure> {
    let status = match response.status {
        StatusCode::ACCEPTED => PollerStatus::InProgress,
        s if s.is_success() => PollerStatus::Succeeded,
        s if s.is_client_error() || s.is_server_error() => PollerStatus::Failed,
        s => {
            return Err(PollFailure::Fatal(format!(
                "unexpected status {} while polling location",
                s.as_u16()
            )));
        }
    };
    let next_url = if status == PollerStatus::InProgress {
        header_url(&response.headers, LOCATION.as_str(), base).map_err(PollFailure::Fatal)?
    } else {
        None
    };
    Ok(Observed {
        status,
        next_url,
        resource_location: None,
    })
}

fn interpret_body(response: &BufferedResponse) -> Result<Observed, PollFailure> {
    if !response.status.is_success() {
        return Err(PollFailure::Response(response.clone().into_error()));
    }
    let status = if response.status == StatusCode::NO_CONTENT || response.body.is_empty() {
        PollerStatus::Succeeded
    } else {
        let value = parse_body(&response.body).map_err(PollFailure::Fatal)?;
        match status_field(&value, PROVISIONING_STATE_POINTER).map_err(PollFailure::Fatal)? {
            Some(status) => status,
            None if response.status == StatusCode::ACCEPTED => PollerStatus::InProgress,
            None => PollerStatus::Succeeded,
        }
    };
    Ok(Observed {
        status,
        next_url: None,
        resource_location: None,
    })
}

fn parse_body(body: &[u8]) -> Result<Value, String> {
    serde_json::from_slice(body).map_err(|e| format!("poll response body is not JSON: {e}"))
}

fn status_field(value: &Value, pointer: &str) -> Result<Option<PollerStatus>, String> {
    match value.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => PollerStatus::from_wire(raw)
            .map(Some)
            .ok_or_else(|| format!("empty status at {pointer}")),
        Some(other) => Err(format!("status at {pointer} is not a string: {other}")),
    }
}

fn status_monitor_url(headers: &HeaderMap, base: &Url) -> Result<Option<Url>, String> {
    if let Some(url) = header_url(headers, AZURE_ASYNC_OPERATION_HEADER, base)? {
        return Ok(Some(url));
    }
    header_url(headers, OPERATION_LOCATION_HEADER, base)
}

fn header_url(headers: &HeaderMap, name: &str, base: &Url) -> Result<Option<Url>, String> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let raw = value
        .to_str()
        .map_err(|_| format!("{name} header is not valid UTF-8"))?
        .trim();
    if raw.is_empty() {
        return Ok(None);
    }
    base.join(raw)
        .map(Some)
        .map_err(|e| format!("{name} header is not a valid URL: {e}"))
}
