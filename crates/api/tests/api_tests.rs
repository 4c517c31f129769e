use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use fleet_api::{create_routes, AppState};
use fleet_core::{ConfigBundle, NodeDescriptor, NodeRole};
use fleet_distribution::{
    ConfigApplier, DistributionService, DistributionServiceConfig, LocalConfigClient,
    SettingsHandler,
};
use fleet_infrastructure::{InMemoryAuditSink, InMemoryHeartbeatLink};
use fleet_queue::{WorkQueueConfig, WorkQueueProducer};
use fleet_topology::{TopologyManager, TopologyManagerConfig};
use serde_json::{json, Value};
use tower::ServiceExt;

fn control_node() -> NodeDescriptor {
    NodeDescriptor::new(
        "control",
        "http://control:8080",
        NodeRole::Full,
        Vec::<String>::new(),
    )
}

/// 创建控制端节点的路由
fn control_app() -> Router {
    let link = Arc::new(InMemoryHeartbeatLink::new());
    let audit = Arc::new(InMemoryAuditSink::new());
    let topology = Arc::new(TopologyManager::new(
        link,
        audit.clone(),
        TopologyManagerConfig::default(),
    ));
    let queue = Arc::new(WorkQueueProducer::new(
        topology.clone(),
        audit.clone(),
        WorkQueueConfig::default(),
    ));
    let distribution = Arc::new(DistributionService::new(
        topology.clone(),
        Arc::new(LocalConfigClient::new()),
        audit,
        DistributionServiceConfig::new("control"),
    ));

    create_routes(
        AppState::new(control_node())
            .with_topology(topology)
            .with_queue(queue)
            .with_distribution(distribution),
    )
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_health_reports_node() {
    let app = control_app();
    let (status, json) = send(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["status"], "ok");
    assert_eq!(json["data"]["node_id"], "control");
    assert_eq!(json["data"]["active_item_count"], 0);

    let (_, json) = send(&app, Method::GET, "/api/node", None).await;
    assert_eq!(json["data"]["id"], "control");
    assert_eq!(json["data"]["role"], "full");
}

#[tokio::test]
async fn test_join_heartbeat_and_leave() {
    let app = control_app();
    let descriptor = json!({
        "id": "client-1",
        "address": "http://client-1:8080",
        "role": "client",
        "capabilities": ["light_requests"],
    });

    let (status, _) = send(&app, Method::POST, "/api/topology/join", Some(descriptor.clone())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send(
        &app,
        Method::POST,
        "/api/topology/heartbeat",
        Some(json!({
            "descriptor": descriptor,
            "active_item_count": 2,
            "timestamp": chrono::Utc::now(),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["load"]["active_item_count"], 2);

    let (_, json) = send(&app, Method::GET, "/api/topology", None).await;
    assert_eq!(json["data"]["nodes"]["client-1"]["status"], "healthy");

    let (status, _) = send(&app, Method::DELETE, "/api/topology/nodes/client-1", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, json) = send(&app, Method::DELETE, "/api/topology/nodes/client-1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_work_item_lifecycle_over_http() {
    let app = control_app();
    send(
        &app,
        Method::POST,
        "/api/topology/join",
        Some(json!({
            "id": "w1",
            "address": "http://w1:8080",
            "role": "client",
            "capabilities": [],
        })),
    )
    .await;

    let (status, json) = send(
        &app,
        Method::POST,
        "/api/items",
        Some(json!({"item_type": "urgent", "payload": {"n": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let item_id = json["data"]["item_id"].as_str().unwrap().to_string();

    let (status, json) = send(
        &app,
        Method::POST,
        "/api/queue/request",
        Some(json!({"node_id": "w1", "max_count": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"].as_array().unwrap().len(), 1);
    assert_eq!(json["data"][0]["priority"], "high");

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/api/items/{item_id}/complete"),
        Some(json!({"result": {"ok": true}, "duration_ms": 12})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // 已完成的工作项不能再次上报
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/api/items/{item_id}/fail"),
        Some(json!({"error": "late"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, json) = send(&app, Method::GET, &format!("/api/items/{item_id}"), None).await;
    assert_eq!(json["data"]["status"], "completed");

    let (_, json) = send(&app, Method::GET, "/api/queue/status", None).await;
    assert_eq!(json["data"]["completed_count"], 1);
    assert_eq!(json["data"]["total_submitted"], 1);
}

#[tokio::test]
async fn test_unknown_consumer_gets_service_unavailable() {
    let app = control_app();
    let (status, json) = send(
        &app,
        Method::POST,
        "/api/queue/request",
        Some(json!({"node_id": "ghost", "max_count": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json["message"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn test_cancel_pending_item() {
    let app = control_app();
    let (_, json) = send(
        &app,
        Method::POST,
        "/api/items",
        Some(json!({"item_type": "batch", "payload": {}})),
    )
    .await;
    let item_id = json["data"]["item_id"].as_str().unwrap().to_string();

    let (status, json) = send(&app, Method::DELETE, &format!("/api/items/{item_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["cancelled"], true);

    let (status, _) = send(&app, Method::DELETE, "/api/items/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_publish_and_history() {
    let app = control_app();
    let (status, json) = send(
        &app,
        Method::POST,
        "/api/config/publish",
        Some(json!({"content": "{\"a\":1}", "version": "v2"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["version"], "v2");

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/config/publish",
        Some(json!({"content": "{}", "version": "v1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, json) = send(&app, Method::GET, "/api/config/current", None).await;
    assert_eq!(json["data"]["version"], "v2");

    let (status, json) = send(&app, Method::GET, "/api/config/history", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_client_applies_pushed_bundle() {
    let settings = Arc::new(SettingsHandler::new());
    let applier = Arc::new(ConfigApplier::new("client-1").with_handler(settings.clone()));
    let node = NodeDescriptor::new(
        "client-1",
        "http://client-1:8080",
        NodeRole::Client,
        Vec::<String>::new(),
    );
    let app = create_routes(AppState::new(node).with_applier(applier.clone()));

    let bundle = ConfigBundle::new("v1", br#"{"mode":"fast"}"#.to_vec(), "control");
    let (status, json) = send(
        &app,
        Method::POST,
        "/api/config/apply",
        Some(serde_json::to_value(&bundle).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["applied"], true);
    assert_eq!(settings.settings()["mode"], "fast");

    let mut tampered = ConfigBundle::new("v2", b"{}".to_vec(), "control");
    tampered.checksum = bundle.checksum.clone();
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/config/apply",
        Some(serde_json::to_value(&tampered).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(applier.current_version().await.as_deref(), Some("v1"));

    // 客户端节点没有启用工作队列
    let (status, _) = send(&app, Method::GET, "/api/queue/status", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_supervision_report_without_supervisor() {
    let app = control_app();
    let (status, json) = send(&app, Method::GET, "/api/system/supervision", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["data"]["processes"].as_array().unwrap().is_empty());
}
