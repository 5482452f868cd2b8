//! Tests against a real HTTP server through the reqwest transport

use crate::helpers::*;
use pretty_assertions::assert_eq;
use rampart_client::{BlockingClient, Client};
use rampart_config::ConfigLoader;
use rampart_core::ErrorKind;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

#[derive(Debug, Deserialize, PartialEq)]
struct Widget {
    id: u32,
}

async fn client_for(server: &MockServer) -> Client {
    init_tracing();
    Client::builder()
        .base_url(server.uri())
        .retry(fixed_retry(3, Duration::from_millis(10)))
        .build()
        .await
        .expect("client builds")
}

#[tokio::test]
async fn test_retries_server_errors_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 7})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let widget: Widget = client.get("/flaky").send_json().await.unwrap();

    assert_eq!(widget, Widget { id: 7 });
}

#[tokio::test]
async fn test_default_and_request_headers_reach_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/widgets"))
        .and(header("x-tenant", "acme"))
        .and(header("idempotency-key", "create-1"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::builder()
        .base_url(server.uri())
        .header("x-tenant", "acme")
        .build()
        .await
        .unwrap();
    let created: Widget = client
        .post("/widgets")
        .idempotency_key("create-1")
        .json(&json!({"name": "bolt"}))
        .send_json()
        .await
        .unwrap();

    assert_eq!(created.id, 1);
}

#[tokio::test]
async fn test_connection_refused_is_transport_error() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = Client::builder()
        .base_url(format!("http://127.0.0.1:{port}"))
        .retry(fixed_retry(2, Duration::from_millis(5)))
        .build()
        .await
        .unwrap();
    let err = client.get("/gone").send().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(err.attempts(), 2);
}

#[tokio::test]
async fn test_client_from_config_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .and(header("x-env", "staging"))
        .respond_with(ResponseTemplate::new(200).set_body_string("up"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("client.toml");
    std::fs::write(
        &file,
        format!(
            r#"
base_url = "{}"

[headers]
x-env = "staging"

[retry]
max_attempts = 2
backoff_factor = "10ms"
"#,
            server.uri()
        ),
    )
    .unwrap();

    let config = ConfigLoader::new()
        .without_env()
        .with_file(&file)
        .load()
        .await
        .unwrap();
    let client = Client::new(config).await.unwrap();

    let response = client.get("/status").send().await.unwrap();
    assert_eq!(response.text().unwrap(), "up");
}

#[tokio::test]
async fn test_paginate_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/widgets"))
        .respond_with(|request: &Request| {
            let offset = request
                .url
                .query_pairs()
                .find(|(k, _)| k == "offset")
                .and_then(|(_, v)| v.parse::<u32>().ok())
                .unwrap_or(0);
            let data: Vec<_> = (offset..5).take(2).map(|id| json!({"id": id})).collect();
            ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
        })
        .expect(3)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let widgets: Vec<Widget> = client
        .paginate_with("/widgets", rampart_client::OffsetLimitPagination::with_limit(2))
        .collect_all()
        .await
        .unwrap();

    let ids: Vec<u32> = widgets.iter().map(|w| w.id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_blocking_client_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/widgets/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 9})))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    let widget = tokio::task::spawn_blocking(move || {
        let client =
            BlockingClient::from_builder(Client::builder().base_url(uri)).expect("client builds");
        client.get("/widgets/9").send_json::<Widget>()
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(widget, Widget { id: 9 });
}
