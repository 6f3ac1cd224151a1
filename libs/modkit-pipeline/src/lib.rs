#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Client-side HTTP request pipeline for `ModKit` service SDKs
//!
//! This crate provides the runtime a generated service client sits on:
//! - A mutable [`Request`] with a replayable body, a cancellation token and
//!   typed per-operation values
//! - An ordered chain of [`Policy`] values ending in a [`Transport`]
//! - Retry with exponential backoff, jitter and `Retry-After` hints
//! - A [`Poller`] for long-running operations, resumable from a string token
//! - A [`Pager`] that walks continuation cursors and yields items lazily
//!
//! The default transport is hyper with rustls (HTTPS only by default), a
//! connection pool and transparent response decompression.
//!
//! # Example
//!
//! ```ignore
//! use modkit_pipeline::{PipelineBuilder, Request};
//! use http::Method;
//!
//! let pipeline = PipelineBuilder::new()
//!     .application_id("my-app")
//!     .build()?;
//!
//! let mut request = Request::parse(Method::GET, "https://svc.example.com/items/1")?;
//! let item: Item = pipeline
//!     .send(&mut request)
//!     .await?
//!     .error_for_status()
//!     .await?
//!     .json()
//!     .await?;
//! ```
//!
//! # Long-running operations
//!
//! ```ignore
//! let mut request = Request::parse(Method::PUT, "https://svc.example.com/items/1")?;
//! request.set_json(&item)?;
//! let initial = pipeline.send(&mut request).await?;
//!
//! let mut poller = Poller::<Item>::new(pipeline.clone(), &request, initial).await?;
//! let token = poller.resume_token()?;
//! let item = poller.poll_until_done(Duration::from_secs(5), &cancel).await?;
//! ```

mod body;
mod config;
mod error;
mod pager;
mod pipeline;
pub mod policies;
mod policy;
mod poller;
mod request;
mod response;
mod tls;
mod transport;
mod values;

#[cfg(test)]
mod testing;

pub use body::{RequestBody, SeekableSource};
pub use config::{
    DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT, DEFAULT_RETRY_STATUSES, DEFAULT_USER_AGENT,
    ExponentialBackoff, LoggingConfig, PipelineConfig, RetryConfig, RetryTrigger, TlsRootConfig,
    TransportConfig, TransportSecurity,
};
pub use error::{ERROR_BODY_PREVIEW_LIMIT, ERROR_CODE_HEADER, PipelineError, ResponseError};
pub use pager::{ContinuationStrategy, JsonPageFields, Page, PageDecoder, Pager};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use policies::{AccessToken, RetryClassifier, TokenCredential};
pub use policy::{Next, Policy, sleep_or_cancel};
pub use poller::{
    AZURE_ASYNC_OPERATION_HEADER, DEFAULT_DETECTION, Detection, FinalStateVia,
    OPERATION_LOCATION_HEADER, OperationKind, Poller, PollerOptions, PollerStatus, TOKEN_VERSION,
};
pub use request::Request;
pub use response::{
    BufferedResponse, DEFAULT_MAX_BODY_SIZE, LimitedBody, Response, ResponseBody,
    parse_retry_after, read_body_limited,
};
pub use transport::{HyperTransport, Transport};
pub use values::{OperationKey, OperationValues};

/// Re-exported so callers can build cancellation tokens without a direct
/// `tokio-util` dependency.
pub use tokio_util::sync::CancellationToken;
