//! Rate limiting integration tests
//!
//! Local admission through the limiter and the handling of server-side
//! limit signals (429, Retry-After, X-RateLimit-*).

use crate::helpers::*;
use crate::transports::*;
use pretty_assertions::assert_eq;
use rampart_core::{Error, ErrorKind, LimitReason, RateLimitOrigin};
use rampart_resilience::{LimitScope, RateLimitConfig, RateLimitStrategy};
use std::time::Duration;

fn token_bucket(burst_size: u32, max_requests: u32, time_window: Duration) -> RateLimitConfig {
    RateLimitConfig {
        enabled: true,
        strategy: RateLimitStrategy::TokenBucket,
        burst_size,
        max_requests,
        time_window,
        ..RateLimitConfig::default()
    }
}

/// After the burst is spent the next call waits one refill interval
#[tokio::test]
async fn test_token_bucket_waits_for_refill() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(200, &[], ""));
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock).rate_limit(token_bucket(2, 10, Duration::from_secs(1))),
    )
    .await;

    client.get("/a").send().await.unwrap();
    client.get("/a").send().await.unwrap();
    assert!(clock.sleeps().is_empty());

    client.get("/a").send().await.unwrap();

    let waited: Duration = clock.sleeps().iter().sum();
    assert!(waited >= Duration::from_millis(100));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_queue_timeout_is_local_rate_limit_error() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(200, &[], ""));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock).rate_limit(RateLimitConfig {
        queue_timeout: Duration::from_secs(1),
        ..token_bucket(1, 1, Duration::from_secs(60))
    }))
    .await;

    client.get("/a").send().await.unwrap();
    let err = client.get("/a").send().await.unwrap_err();

    match &err {
        Error::RateLimitExceeded {
            origin: RateLimitOrigin::Local { reason, .. },
            ..
        } => assert_eq!(*reason, LimitReason::QueueTimeout),
        other => panic!("expected local rate limit, got {other:?}"),
    }
    assert_eq!(err.attempts(), 0);
    assert_eq!(transport.calls(), 1);
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
}

#[tokio::test]
async fn test_fixed_window_resets_after_window() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(200, &[], ""));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock).rate_limit(RateLimitConfig {
        enabled: true,
        strategy: RateLimitStrategy::FixedWindow,
        max_requests: 2,
        time_window: Duration::from_secs(10),
        ..RateLimitConfig::default()
    }))
    .await;

    for _ in 0..3 {
        client.get("/a").send().await.unwrap();
    }

    assert_eq!(clock.sleeps(), vec![Duration::from_secs(10)]);
}

#[tokio::test]
async fn test_per_host_scopes_are_independent() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(200, &[], ""));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock).rate_limit(RateLimitConfig {
        scopes: vec![LimitScope::PerHost],
        ..token_bucket(1, 1, Duration::from_secs(60))
    }))
    .await;

    client.get("https://a.example.com/").send().await.unwrap();
    client.get("https://b.example.com/").send().await.unwrap();

    assert!(clock.sleeps().is_empty());
    let statuses = client.rate_limit_status();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| s.remaining == 0));
}

#[tokio::test]
async fn test_cache_hits_do_not_consume_capacity() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(200, &[("cache-control", "max-age=300")], "cached"));
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock)
            .cache(memory_cache())
            .rate_limit(token_bucket(1, 1, Duration::from_secs(60))),
    )
    .await;

    for _ in 0..5 {
        client.get("/catalog").send().await.unwrap();
    }

    assert_eq!(transport.calls(), 1);
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_server_429_surfaces_retry_after() {
    let transport = ScriptedTransport::new();
    transport.push(response(429, &[("retry-after", "7")], "slow down"));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock)).await;

    let err = client.get("/a").send().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    assert!(matches!(
        err,
        Error::RateLimitExceeded {
            origin: RateLimitOrigin::Server,
            ..
        }
    ));
}

#[tokio::test]
async fn test_retry_after_floors_backoff() {
    let transport = ScriptedTransport::new();
    transport
        .push(response(503, &[("retry-after", "2")], ""))
        .push(response(200, &[], "ok"));
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock).retry(fixed_retry(3, Duration::from_millis(100))),
    )
    .await;

    client.get("/a").send().await.unwrap();

    assert_eq!(clock.sleeps(), vec![Duration::from_secs(2)]);
}

#[tokio::test]
async fn test_retry_after_holds_local_limiter() {
    let transport = ScriptedTransport::new();
    transport
        .push(response(429, &[("retry-after", "5")], ""))
        .push(response(200, &[], "ok"));
    let clock = manual_clock();
    let client = build(
        builder(&transport, &clock).rate_limit(token_bucket(10, 100, Duration::from_secs(60))),
    )
    .await;

    client.get("/a").send().await.unwrap_err();
    client.get("/a").send().await.unwrap();

    assert_eq!(clock.sleeps(), vec![Duration::from_secs(5)]);
}

#[tokio::test]
async fn test_server_advisory_recorded_per_host() {
    let transport = ScriptedTransport::new();
    transport.push(response(
        200,
        &[
            ("x-ratelimit-limit", "100"),
            ("x-ratelimit-remaining", "42"),
            ("x-ratelimit-reset", "30"),
        ],
        "",
    ));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock)).await;

    client.get("/a").send().await.unwrap();

    let advisory = client.server_rate_limit("api.example.com").unwrap();
    assert_eq!(advisory.limit, Some(100));
    assert_eq!(advisory.remaining, Some(42));
    assert_eq!(advisory.reset_in, Some(Duration::from_secs(30)));
}
