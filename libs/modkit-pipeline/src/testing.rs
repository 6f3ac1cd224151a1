//! Scripted transport for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use url::Url;

use crate::error::PipelineError;
use crate::request::Request;
use crate::response::Response;
use crate::transport::Transport;

enum Step {
    Respond {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    TransportError(&'static str),
    Hang,
}

/// What the transport saw for one send.
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Replays a fixed script of outcomes and records every request.
///
/// Reads the request body the way a real transport does, so a one-shot body
/// is consumed by the first send.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    sent: Mutex<Vec<SentRequest>>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(self, status: StatusCode) -> Self {
        self.respond(status, &[], "")
    }

    #[must_use]
    pub fn respond(
        self,
        status: StatusCode,
        headers: &[(&'static str, &str)],
        body: impl Into<Bytes>,
    ) -> Self {
        let mut map = HeaderMap::new();
        for &(name, value) in headers {
            map.append(
                HeaderName::from_static(name),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        self.script.lock().push_back(Step::Respond {
            status,
            headers: map,
            body: body.into(),
        });
        self
    }

    #[must_use]
    pub fn json(self, status: StatusCode, value: &serde_json::Value) -> Self {
        self.respond(
            status,
            &[("content-type", "application/json")],
            value.to_string(),
        )
    }

    #[must_use]
    pub fn transport_error(self, message: &'static str) -> Self {
        self.script.lock().push_back(Step::TransportError(message));
        self
    }

    /// Never answer; only cancellation ends the send.
    #[must_use]
    pub fn hang(self) -> Self {
        self.script.lock().push_back(Step::Hang);
        self
    }

    #[must_use]
    pub fn send_count(&self) -> usize {
        self.sent.lock().len()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &mut Request) -> Result<Response, PipelineError> {
        let body = request.body_bytes()?;
        self.sent.lock().push(SentRequest {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            body,
        });

        let step = self.script.lock().pop_front();
        match step {
            Some(Step::Respond {
                status,
                headers,
                body,
            }) => Ok(Response::from_bytes(status, headers, body)),
            Some(Step::TransportError(message)) => Err(PipelineError::Transport(message.into())),
            Some(Step::Hang) => std::future::pending().await,
            None => Err(PipelineError::InvalidArgument(
                "scripted transport has no response left".to_owned(),
            )),
        }
    }
}
