mod common;

use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::*;
use registry::{Discovery, Error, Registrar};

fn health_entry(id: &str, port: u16, endpoints: Option<&str>) -> serde_json::Value {
    let mut meta = json!({ "zone": "test" });
    if let Some(endpoints) = endpoints {
        meta["__endpoints"] = json!(endpoints);
    }
    json!({
        "Node": { "Node": "node-1", "Address": "127.0.0.1" },
        "Service": {
            "ID": id,
            "Service": "orders",
            "Tags": ["1.0.0"],
            "Address": "127.0.0.1",
            "Port": port,
            "Meta": meta,
        },
        "Checks": [],
    })
}

// ── Registration ────────────────────────────────────────────────

#[tokio::test]
async fn register_sends_service_with_ttl_check() {
    let server = MockServer::start_async().await;
    let register = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/v1/agent/service/register")
                .json_body_partial(
                    r#"{
                        "ID": "a1",
                        "Name": "orders",
                        "Tags": ["1.0.0"],
                        "Address": "127.0.0.1",
                        "Port": 8080,
                        "Check": {
                            "CheckID": "service:a1",
                            "TTL": "15s",
                            "DeregisterCriticalServiceAfter": "30s",
                            "Status": "passing"
                        }
                    }"#,
                );
            then.status(200);
        })
        .await;
    let deregister = server
        .mock_async(|when, then| {
            when.method(PUT).path("/v1/agent/service/deregister/a1");
            then.status(200);
        })
        .await;

    let registry = consul_registry(consul_config(&server.address().to_string()));
    let orders = instance("orders", "a1", 8080);

    registry.register(&orders).await.unwrap();
    assert!(registry.is_registered("a1").await);
    register.assert_hits_async(1).await;

    registry.deregister(&orders).await.unwrap();
    assert!(!registry.is_registered("a1").await);
    deregister.assert_hits_async(1).await;
}

#[tokio::test]
async fn acl_token_is_sent_on_every_request() {
    let server = MockServer::start_async().await;
    let register = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/v1/agent/service/register")
                .header("X-Consul-Token", "secret-token");
            then.status(200);
        })
        .await;
    let health = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/health/service/orders")
                .header("X-Consul-Token", "secret-token");
            then.status(200)
                .header("X-Consul-Index", "3")
                .json_body(json!([]));
        })
        .await;

    let mut config = consul_config(&server.address().to_string());
    config.token = Some("secret-token".to_string());
    let registry = consul_registry(config);

    registry.register(&instance("orders", "a1", 8080)).await.unwrap();
    assert!(registry.get_service("orders").await.unwrap().is_empty());

    register.assert_hits_async(1).await;
    health.assert_hits_async(1).await;
}

#[tokio::test]
async fn register_surfaces_consul_errors() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(500).body("agent unavailable");
        })
        .await;

    let registry = consul_registry(consul_config(&server.address().to_string()));
    let err = registry
        .register(&instance("orders", "a1", 8080))
        .await
        .unwrap_err();

    match err {
        Error::Consul { status, body, .. } => {
            assert_eq!(status, 500);
            assert_eq!(body, "agent unavailable");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!registry.is_registered("a1").await);
}

#[tokio::test]
async fn invalid_instance_is_rejected_before_any_request() {
    let server = MockServer::start_async().await;
    let register = server
        .mock_async(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(200);
        })
        .await;

    let registry = consul_registry(consul_config(&server.address().to_string()));
    let bad = instance("orders/../admin", "a1", 8080);

    assert!(matches!(
        registry.register(&bad).await,
        Err(Error::InvalidInstance(_))
    ));
    register.assert_hits_async(0).await;
}

// ── Heartbeat ───────────────────────────────────────────────────

#[tokio::test]
async fn heartbeat_marks_check_passing() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(200);
        })
        .await;
    let pass = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/v1/agent/check/update/service:a1")
                .json_body(json!({ "Status": "passing", "Output": "healthy" }));
            then.status(200);
        })
        .await;

    let mut config = consul_config(&server.address().to_string());
    config.ttl = Duration::from_millis(200);
    let registry = consul_registry(config);
    registry.register(&instance("orders", "a1", 8080)).await.unwrap();

    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || async {
        pass.hits_async().await >= 2
    })
    .await;
}

#[tokio::test]
async fn failed_heartbeat_triggers_reregistration() {
    let server = MockServer::start_async().await;
    let register = server
        .mock_async(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(200);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path("/v1/agent/check/update/service:a1");
            then.status(404).body("CheckID \"service:a1\" does not have associated TTL");
        })
        .await;

    let mut config = consul_config(&server.address().to_string());
    config.ttl = Duration::from_millis(200);
    let registry = consul_registry(config);
    registry.register(&instance("orders", "a1", 8080)).await.unwrap();

    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || async {
        register.hits_async().await >= 2
    })
    .await;
}

#[tokio::test]
async fn deregister_stops_the_heartbeat() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(200);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path("/v1/agent/service/deregister/a1");
            then.status(200);
        })
        .await;
    let pass = server
        .mock_async(|when, then| {
            when.method(PUT).path("/v1/agent/check/update/service:a1");
            then.status(200);
        })
        .await;

    let mut config = consul_config(&server.address().to_string());
    config.ttl = Duration::from_millis(100);
    let registry = consul_registry(config);
    let orders = instance("orders", "a1", 8080);

    registry.register(&orders).await.unwrap();
    registry.deregister(&orders).await.unwrap();
    // Let any request that was already on the wire land.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let hits = pass.hits_async().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pass.hits_async().await, hits);
}

// ── Discovery ───────────────────────────────────────────────────

#[tokio::test]
async fn get_service_maps_passing_instances() {
    let server = MockServer::start_async().await;
    let health = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/health/service/orders")
                .query_param("passing", "true")
                .query_param("index", "0");
            then.status(200).header("X-Consul-Index", "7").json_body(json!([
                health_entry("a1", 8080, Some(r#"["http://127.0.0.1:8080","grpc://127.0.0.1:9000"]"#)),
                health_entry("b2", 8081, None),
            ]));
        })
        .await;

    let registry = consul_registry(consul_config(&server.address().to_string()));
    let mut instances = registry.get_service("orders").await.unwrap();
    instances.sort_by(|a, b| a.id.cmp(&b.id));

    health.assert_hits_async(1).await;
    assert_eq!(ids(&instances), vec!["a1", "b2"]);

    let a1 = &instances[0];
    assert_eq!(a1.name, "orders");
    assert_eq!(a1.version, "1.0.0");
    assert_eq!(
        a1.endpoints,
        vec!["http://127.0.0.1:8080", "grpc://127.0.0.1:9000"]
    );
    assert_eq!(a1.metadata.get("zone").map(String::as_str), Some("test"));
    assert!(!a1.metadata.contains_key("__endpoints"));

    assert_eq!(instances[1].endpoints, vec!["http://127.0.0.1:8081"]);
}

#[tokio::test]
async fn get_service_with_no_instances_is_empty() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/health/service/orders");
            then.status(200)
                .header("X-Consul-Index", "1")
                .body("null");
        })
        .await;

    let registry = consul_registry(consul_config(&server.address().to_string()));
    assert!(registry.get_service("orders").await.unwrap().is_empty());
}

#[tokio::test]
async fn watch_pushes_when_index_advances() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/health/service/orders")
                .query_param("index", "0");
            then.status(200)
                .header("X-Consul-Index", "5")
                .json_body(json!([health_entry("a1", 8080, None)]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/health/service/orders")
                .query_param("index", "5");
            then.status(200).header("X-Consul-Index", "6").json_body(json!([
                health_entry("a1", 8080, None),
                health_entry("b2", 8081, None),
            ]));
        })
        .await;
    // Blocks, then reports no change.
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/health/service/orders")
                .query_param("index", "6");
            then.status(200)
                .delay(Duration::from_millis(100))
                .header("X-Consul-Index", "6")
                .json_body(json!([
                    health_entry("a1", 8080, None),
                    health_entry("b2", 8081, None),
                ]));
        })
        .await;

    let registry = consul_registry(consul_config(&server.address().to_string()));
    let watcher = registry
        .watch("orders", &CancellationToken::new())
        .await
        .unwrap();

    // Current members first, then the change.
    assert_eq!(ids(&next_members(watcher.as_ref()).await), vec!["a1"]);
    assert_eq!(ids(&next_members(watcher.as_ref()).await), vec!["a1", "b2"]);

    // Unchanged index: nothing else is pushed.
    assert!(
        tokio::time::timeout(Duration::from_millis(400), watcher.next())
            .await
            .is_err()
    );

    watcher.stop().unwrap();
    watcher.stop().unwrap();
    assert!(matches!(watcher.next().await, Err(Error::WatcherStopped)));
}

#[tokio::test]
async fn watch_after_register_returns_the_registered_instance() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(200);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/health/service/orders")
                .query_param("index", "0");
            then.status(200)
                .header("X-Consul-Index", "3")
                .json_body(json!([health_entry("a1", 8080, None)]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/health/service/orders")
                .query_param("index", "3");
            then.status(200)
                .delay(Duration::from_millis(100))
                .header("X-Consul-Index", "3")
                .json_body(json!([health_entry("a1", 8080, None)]));
        })
        .await;

    let registry = consul_registry(consul_config(&server.address().to_string()));
    registry.register(&instance("orders", "a1", 8080)).await.unwrap();

    let watcher = registry
        .watch("orders", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ids(&next_members(watcher.as_ref()).await), vec!["a1"]);

    watcher.stop().unwrap();
}

#[tokio::test]
async fn watch_resets_cursor_when_index_goes_backwards() {
    let server = MockServer::start_async().await;
    let initial = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/health/service/orders")
                .query_param("index", "0");
            then.status(200)
                .header("X-Consul-Index", "10")
                .json_body(json!([health_entry("a1", 8080, None)]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/health/service/orders")
                .query_param("index", "10");
            then.status(200)
                .header("X-Consul-Index", "2")
                .json_body(json!([]));
        })
        .await;

    let registry = consul_registry(consul_config(&server.address().to_string()));
    let watcher = registry
        .watch("orders", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ids(&next_members(watcher.as_ref()).await), vec!["a1"]);
    // After the reset the index=0 query runs again and its answer is pushed.
    assert_eq!(ids(&next_members(watcher.as_ref()).await), vec!["a1"]);
    assert!(initial.hits_async().await >= 2);
    watcher.stop().unwrap();
}

#[tokio::test]
async fn watch_survives_query_errors() {
    let server = MockServer::start_async().await;
    let failing = server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/health/service/orders");
            then.status(500);
        })
        .await;

    let registry = consul_registry(consul_config(&server.address().to_string()));
    let parent = CancellationToken::new();
    let watcher = registry.watch("orders", &parent).await.unwrap();

    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || async {
        failing.hits_async().await >= 1
    })
    .await;

    parent.cancel();
    let result = tokio::time::timeout(WAIT_TIMEOUT, watcher.next())
        .await
        .expect("timed out");
    assert!(matches!(result, Err(Error::WatchCancelled)));
}
