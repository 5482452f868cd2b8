//! HTTP caching integration tests

use crate::helpers::*;
use crate::transports::*;
use pretty_assertions::assert_eq;
use rampart_core::{CacheDirective, ErrorKind, ResponseSource};
use rampart_resilience::{CacheBackendKind, CacheConfig};
use std::time::Duration;

#[tokio::test]
async fn test_stale_entry_revalidated_by_304() {
    let transport = ScriptedTransport::new();
    transport
        .push(response(
            200,
            &[("cache-control", "max-age=60"), ("etag", "\"v1\"")],
            "catalog",
        ))
        .push(response(304, &[("cache-control", "max-age=60")], ""));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock).cache(memory_cache())).await;

    let first = client.get("/catalog").send().await.unwrap();
    assert_eq!(first.source(), ResponseSource::Network);

    let cached = client.get("/catalog").send().await.unwrap();
    assert_eq!(cached.source(), ResponseSource::Cache);
    assert_eq!(transport.calls(), 1);

    clock.advance(Duration::from_secs(61));
    let revalidated = client.get("/catalog").send().await.unwrap();
    assert_eq!(revalidated.source(), ResponseSource::Revalidated);
    assert_eq!(revalidated.text().unwrap(), "catalog");
    assert_eq!(
        transport.requests()[1]
            .headers()
            .get("if-none-match")
            .and_then(|v| v.to_str().ok()),
        Some("\"v1\"")
    );

    let again = client.get("/catalog").send().await.unwrap();
    assert_eq!(again.source(), ResponseSource::Cache);
    assert_eq!(transport.calls(), 2);

    let stats = client.cache_stats().await.unwrap();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.stale_hits, 1);
    assert_eq!(stats.revalidations, 1);
}

#[tokio::test]
async fn test_vary_keeps_variants_apart() {
    let transport = ScriptedTransport::new();
    transport
        .push(response(
            200,
            &[("cache-control", "max-age=300"), ("vary", "Accept-Language")],
            "hello",
        ))
        .push(response(
            200,
            &[("cache-control", "max-age=300"), ("vary", "Accept-Language")],
            "hallo",
        ));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock).cache(memory_cache())).await;

    let greet = |lang: &'static str| {
        let client = client.clone();
        async move {
            client
                .get("/greeting")
                .header("accept-language", lang)
                .send()
                .await
                .unwrap()
        }
    };

    assert_eq!(greet("en").await.text().unwrap(), "hello");
    assert_eq!(greet("de").await.text().unwrap(), "hallo");
    assert_eq!(transport.calls(), 2);

    let english = greet("en").await;
    assert_eq!(english.source(), ResponseSource::Cache);
    assert_eq!(english.text().unwrap(), "hello");
    let german = greet("de").await;
    assert_eq!(german.source(), ResponseSource::Cache);
    assert_eq!(german.text().unwrap(), "hallo");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_disk_cache_survives_client_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        enabled: true,
        backend: CacheBackendKind::Disk,
        disk_path: Some(dir.path().to_path_buf()),
        ..CacheConfig::default()
    };

    let transport = ScriptedTransport::new();
    transport.push(response(200, &[("cache-control", "max-age=600")], "persisted"));
    let clock = manual_clock();
    let first = build(builder(&transport, &clock).cache(config.clone())).await;
    first.get("/reports/1").send().await.unwrap();
    drop(first);

    let offline = ScriptedTransport::new();
    let clock = manual_clock();
    let second = build(builder(&offline, &clock).cache(config)).await;
    let response = second.get("/reports/1").send().await.unwrap();

    assert_eq!(response.source(), ResponseSource::Cache);
    assert_eq!(response.text().unwrap(), "persisted");
    assert_eq!(offline.calls(), 0);
}

#[tokio::test]
async fn test_invalidate_by_pattern() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(200, &[("cache-control", "max-age=300")], "item"));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock).cache(memory_cache())).await;

    for path in ["/items/1", "/items/2", "/users/1"] {
        client.get(path).send().await.unwrap();
    }

    let removed = client
        .invalidate_cache_pattern("GET https://api.example.com/items*")
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let user = client.get("/users/1").send().await.unwrap();
    assert_eq!(user.source(), ResponseSource::Cache);
    let item = client.get("/items/1").send().await.unwrap();
    assert_eq!(item.source(), ResponseSource::Network);
    assert_eq!(transport.calls(), 4);
}

#[tokio::test]
async fn test_unsafe_request_invalidates_resource() {
    let transport = ScriptedTransport::new();
    transport
        .push(response(200, &[("cache-control", "max-age=300")], "v1"))
        .push_status(204)
        .push(response(200, &[("cache-control", "max-age=300")], "v2"));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock).cache(memory_cache())).await;

    client.get("/doc").send().await.unwrap();
    client.put("/doc").body("v2").send().await.unwrap();
    let after = client.get("/doc").send().await.unwrap();

    assert_eq!(after.text().unwrap(), "v2");
    assert_eq!(after.source(), ResponseSource::Network);
}

#[tokio::test]
async fn test_no_store_is_never_stored() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(200, &[("cache-control", "no-store")], "secret"));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock).cache(memory_cache())).await;

    client.get("/secret").send().await.unwrap();
    client.get("/secret").send().await.unwrap();

    assert_eq!(transport.calls(), 2);
    assert_eq!(client.cache_stats().await.unwrap().stores, 0);
}

#[tokio::test]
async fn test_request_directives() {
    let transport = ScriptedTransport::new();
    transport.repeat(response(200, &[("cache-control", "max-age=300")], "fresh"));
    let clock = manual_clock();
    let client = build(builder(&transport, &clock).cache(memory_cache())).await;

    let miss = client
        .get("/offline")
        .cache(CacheDirective::OnlyIfCached)
        .send()
        .await
        .unwrap_err();
    assert_eq!(miss.kind(), ErrorKind::NotCached);
    assert_eq!(transport.calls(), 0);

    client
        .get("/offline")
        .cache(CacheDirective::NoStore)
        .send()
        .await
        .unwrap();
    assert_eq!(client.cache_stats().await.unwrap().stores, 0);

    client.get("/offline").send().await.unwrap();
    let hit = client
        .get("/offline")
        .cache(CacheDirective::OnlyIfCached)
        .send()
        .await
        .unwrap();
    assert_eq!(hit.source(), ResponseSource::Cache);
    assert_eq!(transport.calls(), 2);
}
