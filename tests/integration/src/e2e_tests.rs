//! End-to-end request flows through the full pipeline

use crate::helpers::*;
use crate::transports::*;
use pretty_assertions::assert_eq;
use rampart_core::{ErrorKind, NotRetryableReason, RetryTermination, TransportError};
use rampart_resilience::CircuitState;
use rampart_telemetry::{LoggingMiddleware, Metrics};
use std::sync::Arc;
use std::time::Duration;

/// 500, 500, 500, 200 with three attempts ends on the third 500
#[tokio::test]
async fn test_retry_budget_exhausts_on_third_failure() {
    let transport = ScriptedTransport::new();
    transport
        .push(response(500, &[], "first"))
        .push(response(500, &[], "second"))
        .push(response(500, &[], "third"))
        .push(response(200, &[], "ok"));
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock).retry(fixed_retry(3, Duration::from_millis(200))),
    )
    .await;

    let err = client.get("/orders").send().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Server);
    assert_eq!(err.attempts(), 3);
    assert_eq!(err.termination(), Some(RetryTermination::Exhausted));
    let body = err.context().and_then(|c| c.body.clone()).unwrap();
    assert_eq!(&body[..], b"third");
    assert_eq!(transport.calls(), 3);

    let sleeps = clock.sleeps();
    assert_eq!(sleeps.len(), 2);
    assert!(sleeps[0] >= Duration::from_millis(200));
    assert!(sleeps[1] >= Duration::from_millis(400));
}

/// Five failures open the breaker; the sixth call never reaches the transport
#[tokio::test]
async fn test_breaker_opens_after_five_failures() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(503, &[], ""));
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock).circuit_breaker(breaker(5, Duration::from_secs(30))),
    )
    .await;

    for _ in 0..5 {
        let err = client.get("/orders").send().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Server);
    }
    clock.advance(Duration::from_secs(10));
    let err = client.get("/orders").send().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CircuitRejected);
    assert_eq!(transport.calls(), 5);
    assert_eq!(
        client.circuit_stats("global").map(|s| s.state),
        Some(CircuitState::Open)
    );
}

#[tokio::test]
async fn test_transient_errors_recovered_by_retry() {
    let transport = ScriptedTransport::new();
    transport
        .push_error(TransportError::connect("connection refused"))
        .push_error(TransportError::read_timeout(Duration::from_secs(30)))
        .push(response(200, &[], "done"));
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock).retry(fixed_retry(3, Duration::from_millis(50))),
    )
    .await;

    let response = client.get("/jobs/1").send().await.unwrap();

    assert_eq!(response.text().unwrap(), "done");
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(50), Duration::from_millis(100)]
    );
}

#[tokio::test]
async fn test_post_without_key_is_never_retried() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(503, &[], ""));
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock).retry(fixed_retry(5, Duration::from_millis(50))),
    )
    .await;

    let err = client
        .post("/payments")
        .json(&serde_json::json!({"amount": 10}))
        .send()
        .await
        .unwrap_err();

    assert_eq!(transport.calls(), 1);
    assert_eq!(
        err.termination(),
        Some(RetryTermination::NotRetryable(
            NotRetryableReason::MethodNotEligible
        ))
    );
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_post_with_key_is_retried_with_same_key() {
    let transport = ScriptedTransport::new();
    transport.push_status(503).push_status(201);
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock).retry(fixed_retry(3, Duration::from_millis(50))),
    )
    .await;

    let response = client
        .post("/payments")
        .idempotency_key("pay-7")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);
    let keys: Vec<_> = transport
        .requests()
        .iter()
        .map(|r| r.idempotency_key().map(str::to_string))
        .collect();
    assert_eq!(keys, vec![Some("pay-7".to_string()), Some("pay-7".to_string())]);
}

#[tokio::test]
async fn test_client_errors_are_fatal() {
    let transport = ScriptedTransport::new();
    transport.push_status(404).push_status(200);
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock).retry(fixed_retry(3, Duration::from_millis(50))),
    )
    .await;

    let err = client.get("/missing").send().await.unwrap_err();

    assert!(err.is_not_found());
    assert!(!err.is_retryable());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_total_timeout_stops_retries() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(503, &[], ""));
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock)
            .retry(fixed_retry(10, Duration::from_secs(1)))
            .total_timeout(Duration::from_secs(5)),
    )
    .await;

    let err = client.get("/slow").send().await.unwrap_err();

    // Delays of 1s, 2s fit in 5s; the next 4s delay would overrun it.
    assert_eq!(transport.calls(), 3);
    assert_eq!(
        err.termination(),
        Some(RetryTermination::NotRetryable(
            NotRetryableReason::DeadlineExceeded
        ))
    );
}

#[tokio::test]
async fn test_telemetry_middleware_in_both_insertion_points() {
    let transport = ScriptedTransport::new();
    transport.push_status(502).push_status(200);
    let clock = manual_clock();
    let metrics = Arc::new(Metrics::new().unwrap());
    let client = build(
        builder(&transport, &clock)
            .retry(fixed_retry(3, Duration::from_millis(10)))
            .per_call(LoggingMiddleware::new().with_clock(clock.clone()))
            .per_attempt(metrics.middleware().with_clock(clock.clone())),
    )
    .await;

    client.get("/reports").send().await.unwrap();

    assert_eq!(
        metrics.attempts("GET", "api.example.com", "retryable_failure"),
        1
    );
    assert_eq!(metrics.attempts("GET", "api.example.com", "success"), 1);

    let ids: Vec<_> = transport
        .requests()
        .iter()
        .map(|r| r.headers().get("x-request-id").cloned())
        .collect();
    assert!(ids[0].is_some());
    assert_eq!(ids[0], ids[1]);
}
