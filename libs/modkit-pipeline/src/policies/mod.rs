//! Built-in pipeline policies
//!
//! ## Available Policies
//!
//! - [`HeadersPolicy`] - Default headers plus per-call [`CustomHeaders`]
//! - [`TelemetryPolicy`] - Adds the User-Agent header
//! - [`RequestIdPolicy`] - Adds a client request id shared by all attempts
//! - [`LoggingPolicy`] - `outgoing_http` tracing span with redacted logging
//! - [`RetryPolicy`] - Bounded retry with exponential backoff and jitter
//! - [`BearerTokenPolicy`] - Cached bearer token from a [`TokenCredential`]

mod bearer;
mod headers;
mod logging;
mod request_id;
mod retry;
mod telemetry;

pub use bearer::{AccessToken, BearerTokenPolicy, TokenCredential};
pub use headers::{CustomHeaders, HeadersPolicy};
pub use logging::LoggingPolicy;
pub use request_id::{CLIENT_REQUEST_ID_HEADER, RequestIdPolicy};
pub use retry::{RetryClassifier, RetryPolicy, calculate_backoff};
pub use telemetry::TelemetryPolicy;
