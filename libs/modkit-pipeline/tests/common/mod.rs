#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

//! Scripted transport shared by the integration tests

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use modkit_pipeline::{
    Pipeline, PipelineBuilder, PipelineConfig, PipelineError, Request, Response, Transport,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use url::Url;

/// What the transport observed for one send.
#[derive(Debug, Clone)]
pub struct Sent {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

enum Step {
    Respond(StatusCode, HeaderMap, Bytes),
    Hang,
}

/// Answers sends from a queue of canned responses, in order.
///
/// Sends beyond the script get a 500 so an overrun is visible in assertions.
#[derive(Default)]
pub struct Script {
    steps: Mutex<VecDeque<Step>>,
    sent: Mutex<Vec<Sent>>,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, status: u16, headers: &[(&str, &str)], body: &str) -> &Self {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        self.steps.lock().push_back(Step::Respond(
            StatusCode::from_u16(status).unwrap(),
            map,
            Bytes::copy_from_slice(body.as_bytes()),
        ));
        self
    }

    pub fn json(&self, status: u16, body: &serde_json::Value) -> &Self {
        self.respond(
            status,
            &[("content-type", "application/json")],
            &body.to_string(),
        )
    }

    pub fn hang(&self) -> &Self {
        self.steps.lock().push_back(Step::Hang);
        self
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Transport for Script {
    async fn send(&self, request: &mut Request) -> Result<Response, PipelineError> {
        let body = request.body_bytes()?;
        self.sent.lock().push(Sent {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            body,
        });

        let step = self.steps.lock().pop_front();
        match step {
            Some(Step::Respond(status, headers, body)) => {
                Ok(Response::from_bytes(status, headers, body))
            }
            Some(Step::Hang) => std::future::pending().await,
            None => Ok(Response::from_bytes(
                StatusCode::INTERNAL_SERVER_ERROR,
                HeaderMap::new(),
                "script exhausted",
            )),
        }
    }
}

/// Default policy stack with fast retries over `script`.
pub fn pipeline(script: &Arc<Script>) -> Pipeline {
    PipelineBuilder::with_config(PipelineConfig::for_testing())
        .transport(Arc::clone(script) as Arc<dyn Transport>)
        .build()
        .unwrap()
}

pub fn request(method: Method, url: &str) -> Request {
    Request::parse(method, url).unwrap()
}
