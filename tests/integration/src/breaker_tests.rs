//! Circuit breaker behaviour seen through the client

use crate::helpers::*;
use crate::transports::*;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rampart_client::{Client, Fallback};
use rampart_core::{
    ErrorKind, HeaderMap, Outcome, Rejection, RejectionReason, RequestDescriptor, Response,
    ResponseSource, StatusCode,
};
use rampart_resilience::{CircuitBreakerConfig, CircuitState};
use std::time::Duration;

#[tokio::test]
async fn test_threshold_minus_one_keeps_circuit_closed() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(500, &[], ""));
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock).circuit_breaker(breaker(3, Duration::from_secs(30))),
    )
    .await;

    for _ in 0..2 {
        client.get("/a").send().await.unwrap_err();
    }
    assert_eq!(
        client.circuit_stats("global").map(|s| s.state),
        Some(CircuitState::Closed)
    );

    client.get("/a").send().await.unwrap_err();
    assert_eq!(
        client.circuit_stats("global").map(|s| s.state),
        Some(CircuitState::Open)
    );
}

#[tokio::test]
async fn test_half_open_only_after_reset_timeout() {
    let transport = ScriptedTransport::new();
    transport.push_status(500).push_status(500);
    transport.repeat(response(200, &[], "recovered"));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock).circuit_breaker(CircuitBreakerConfig {
        success_threshold: 1,
        ..breaker(2, Duration::from_secs(30))
    }))
    .await;

    client.get("/a").send().await.unwrap_err();
    client.get("/a").send().await.unwrap_err();

    clock.advance(Duration::from_secs(30) - Duration::from_millis(1));
    let err = client.get("/a").send().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitRejected);
    assert_eq!(transport.calls(), 2);

    clock.advance(Duration::from_millis(1));
    let response = client.get("/a").send().await.unwrap();
    assert_eq!(response.text().unwrap(), "recovered");
    assert_eq!(
        client.circuit_stats("global").map(|s| s.state),
        Some(CircuitState::Closed)
    );
}

#[tokio::test]
async fn test_half_open_failure_reopens() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(502, &[], ""));
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock).circuit_breaker(breaker(1, Duration::from_secs(5))),
    )
    .await;

    client.get("/a").send().await.unwrap_err();
    clock.advance(Duration::from_secs(5));
    let probe = client.get("/a").send().await.unwrap_err();
    assert_eq!(probe.kind(), ErrorKind::Server);

    let rejected = client.get("/a").send().await.unwrap_err();
    assert_eq!(rejected.kind(), ErrorKind::CircuitRejected);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_half_open_overflow_rejects_and_reopens() {
    init_tracing();
    let transport = GatedTransport::new();
    transport.fail_next(2);
    let clock = manual_clock();
    let client = Client::builder()
        .base_url(BASE_URL)
        .transport(transport.clone())
        .clock(clock.clone())
        .retry(fixed_retry(1, Duration::from_millis(10)))
        .circuit_breaker(CircuitBreakerConfig {
            half_open_max_calls: 1,
            success_threshold: 1,
            ..breaker(2, Duration::from_secs(30))
        })
        .build()
        .await
        .unwrap();

    client.get("/a").send().await.unwrap_err();
    client.get("/a").send().await.unwrap_err();
    clock.advance(Duration::from_secs(30));

    let in_flight = tokio::spawn({
        let client = client.clone();
        async move { client.get("/a").send().await }
    });
    transport.wait_for(3).await;

    let err = client.get("/a").send().await.unwrap_err();
    match err {
        rampart_core::Error::CircuitRejected { reason, .. } => {
            assert_eq!(reason, RejectionReason::HalfOpenSaturated);
        }
        other => panic!("expected circuit rejection, got {other:?}"),
    }
    assert_eq!(transport.entered(), 3);
    assert_eq!(
        client.circuit_stats("global").map(|s| s.state),
        Some(CircuitState::Open)
    );

    // The admitted call finishes but no longer closes the reopened circuit.
    transport.release(1);
    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.text().unwrap(), "released");
    assert_eq!(
        client.circuit_stats("global").map(|s| s.state),
        Some(CircuitState::Open)
    );
}

#[tokio::test]
async fn test_per_host_breakers_are_independent() {
    let transport = ScriptedTransport::new();
    transport.push_status(500);
    transport.repeat(response(200, &[], "ok"));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock).circuit_breaker(CircuitBreakerConfig {
        per_host: true,
        ..breaker(1, Duration::from_secs(30))
    }))
    .await;

    client.get("https://a.example.com/x").send().await.unwrap_err();
    let err = client.get("https://a.example.com/x").send().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitRejected);

    let ok = client.get("https://b.example.com/x").send().await.unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let states: Vec<_> = client
        .circuit_breakers()
        .into_iter()
        .map(|(target, stats)| (target, stats.state))
        .collect();
    assert_eq!(
        states,
        vec![
            ("https://a.example.com:443".to_string(), CircuitState::Open),
            ("https://b.example.com:443".to_string(), CircuitState::Closed),
        ]
    );
}

#[tokio::test]
async fn test_manual_controls() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(200, &[], "ok"));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock)).await;

    client.force_open("global");
    clock.advance(Duration::from_secs(3600));
    let err = client.get("/a").send().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitRejected);

    client.force_close("global");
    client.get("/a").send().await.unwrap();

    client.force_open("global");
    client.reset_circuits();
    client.get("/a").send().await.unwrap();
    assert_eq!(transport.calls(), 2);
}

struct CachedCopy;

#[async_trait]
impl Fallback for CachedCopy {
    async fn on_rejected(&self, _request: &RequestDescriptor, rejection: &Rejection) -> Outcome {
        let mut headers = HeaderMap::new();
        headers.insert("x-fallback-reason", rejection.reason.to_string().parse().unwrap());
        Outcome::Success(
            Response::new(StatusCode::OK, headers, "[]").with_source(ResponseSource::Fallback),
        )
    }
}

#[tokio::test]
async fn test_fallback_answers_open_circuit() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(503, &[], ""));
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock)
            .circuit_breaker(breaker(1, Duration::from_secs(30)))
            .fallback(CachedCopy),
    )
    .await;

    client.get("/feed").send().await.unwrap_err();
    let response = client.get("/feed").send().await.unwrap();

    assert_eq!(response.source(), ResponseSource::Fallback);
    assert_eq!(response.header_str("x-fallback-reason"), Some("open"));
    assert_eq!(transport.calls(), 1);
}
