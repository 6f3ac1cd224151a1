#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Retry behavior through the default pipeline

mod common;

use common::{Script, pipeline, request};
use http::{Method, StatusCode};
use modkit_pipeline::{
    CancellationToken, PipelineBuilder, PipelineConfig, PipelineError, RetryConfig, Transport,
};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let script = Script::new();
    script
        .respond(503, &[], "busy")
        .respond(503, &[], "busy")
        .respond(200, &[], "done");

    let mut req = request(Method::GET, "https://svc.example.com/items/1");
    let response = pipeline(&script).send(&mut req).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "done");
    assert_eq!(script.send_count(), 3);
}

#[tokio::test]
async fn attempts_are_bounded_and_last_response_returned() {
    let script = Script::new();
    for _ in 0..10 {
        script.respond(503, &[], "still busy");
    }

    let mut req = request(Method::GET, "https://svc.example.com/items/1");
    let response = pipeline(&script).send(&mut req).await.unwrap();

    // 1 initial attempt + 3 retries
    assert_eq!(script.send_count(), 4);
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.text().await.unwrap(), "still busy");
}

#[tokio::test]
async fn non_retryable_status_is_returned_immediately() {
    let script = Script::new();
    script.respond(404, &[("x-ms-error-code", "NotFound")], "missing");

    let mut req = request(Method::GET, "https://svc.example.com/items/9");
    let response = pipeline(&script).send(&mut req).await.unwrap();
    assert_eq!(script.send_count(), 1);

    let err = response.error_for_status().await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
    let PipelineError::Response(detail) = err else {
        panic!("expected response error, got {err:?}");
    };
    assert_eq!(detail.body().as_ref(), b"missing");
    assert_eq!(detail.error_code(), Some("NotFound"));
}

#[tokio::test]
async fn every_attempt_sends_the_full_body() {
    let script = Script::new();
    script
        .respond(500, &[], "")
        .respond(502, &[], "")
        .respond(201, &[], "");

    let mut req = request(Method::PUT, "https://svc.example.com/items/1");
    req.set_json(&serde_json::json!({ "name": "widget" }))
        .unwrap();
    pipeline(&script).send(&mut req).await.unwrap();

    let sent = script.sent();
    assert_eq!(sent.len(), 3);
    for attempt in &sent {
        assert_eq!(attempt.body.as_ref(), br#"{"name":"widget"}"#);
    }
}

#[tokio::test]
async fn seekable_body_is_rewound_between_attempts() {
    let script = Script::new();
    script.respond(503, &[], "").respond(200, &[], "");

    let mut req = request(Method::POST, "https://svc.example.com/upload");
    req.set_body(
        modkit_pipeline::RequestBody::seekable(Cursor::new(b"payload".to_vec())),
        "application/octet-stream",
    )
    .unwrap();
    pipeline(&script).send(&mut req).await.unwrap();

    let sent = script.sent();
    assert_eq!(sent[0].body.as_ref(), b"payload");
    assert_eq!(sent[1].body.as_ref(), b"payload");
    assert_eq!(sent[0].headers["content-length"], "7");
}

#[tokio::test]
async fn one_shot_body_is_not_resent() {
    let script = Script::new();
    script.respond(503, &[], "").respond(200, &[], "");

    let mut req = request(Method::POST, "https://svc.example.com/upload");
    req.set_body_once(Cursor::new(b"stream".to_vec()), "application/octet-stream")
        .unwrap();
    let err = pipeline(&script).send(&mut req).await.unwrap_err();

    assert!(matches!(err, PipelineError::BodyNotReplayable));
    assert_eq!(script.send_count(), 1);
}

#[tokio::test]
async fn request_id_is_stable_across_retries() {
    let script = Script::new();
    script.respond(503, &[], "").respond(200, &[], "");

    let mut req = request(Method::GET, "https://svc.example.com/items/1");
    pipeline(&script).send(&mut req).await.unwrap();

    let sent = script.sent();
    let first = &sent[0].headers["x-ms-client-request-id"];
    assert_eq!(first, &sent[1].headers["x-ms-client-request-id"]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_stops_promptly() {
    let script = Script::new();
    script
        .respond(503, &[("retry-after", "30")], "")
        .respond(200, &[], "");
    let config = PipelineConfig {
        retry: Some(RetryConfig {
            backoff: modkit_pipeline::ExponentialBackoff::new(
                Duration::from_secs(60),
                Duration::from_secs(60),
            ),
            ..RetryConfig::default()
        }),
        ..PipelineConfig::for_testing()
    };
    let pipeline = PipelineBuilder::with_config(config)
        .transport(Arc::clone(&script) as Arc<dyn Transport>)
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let mut req = request(Method::GET, "https://svc.example.com/items/1")
        .with_cancellation(cancel.clone());

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        })
    };

    let started = tokio::time::Instant::now();
    let err = pipeline.send(&mut req).await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, PipelineError::Canceled));
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(script.send_count(), 1);
}

#[tokio::test]
async fn cancellation_interrupts_in_flight_send() {
    let script = Script::new();
    script.hang();

    let cancel = CancellationToken::new();
    let mut req = request(Method::GET, "https://svc.example.com/slow")
        .with_cancellation(cancel.clone());

    let pipeline = pipeline(&script);
    let (result, ()) = tokio::join!(pipeline.send(&mut req), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    assert!(matches!(result, Err(PipelineError::Canceled)));
    assert_eq!(script.send_count(), 1);
}

#[tokio::test]
async fn already_canceled_request_is_never_sent() {
    let script = Script::new();
    script.respond(200, &[], "");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut req =
        request(Method::GET, "https://svc.example.com/items/1").with_cancellation(cancel);

    let err = pipeline(&script).send(&mut req).await.unwrap_err();
    assert!(matches!(err, PipelineError::Canceled));
    assert_eq!(script.send_count(), 0);
}
