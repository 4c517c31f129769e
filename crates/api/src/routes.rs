use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use crate::handlers::{
    config::{apply_config, current_config, distribution_history, publish_config, sync_config},
    health::{health_check, node_info},
    items::{
        cancel_item, complete_item, fail_item, get_item, queue_status, request_items,
        submit_item,
    },
    system::supervision_report,
    topology::{get_topology, join_node, receive_heartbeat, remove_node},
};
use crate::middleware::{cors_layer, request_logging, trace_layer};
use crate::state::AppState;

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/node", get(node_info))
        // 拓扑
        .route("/api/topology", get(get_topology))
        .route("/api/topology/heartbeat", post(receive_heartbeat))
        .route("/api/topology/join", post(join_node))
        .route("/api/topology/nodes/{id}", delete(remove_node))
        // 工作队列
        .route("/api/items", post(submit_item))
        .route("/api/items/{id}", get(get_item).delete(cancel_item))
        .route("/api/items/{id}/complete", post(complete_item))
        .route("/api/items/{id}/fail", post(fail_item))
        .route("/api/queue/request", post(request_items))
        .route("/api/queue/status", get(queue_status))
        // 配置分发
        .route("/api/config/publish", post(publish_config))
        .route("/api/config/sync/{node}", post(sync_config))
        .route("/api/config/history", get(distribution_history))
        .route("/api/config/apply", post(apply_config))
        .route("/api/config/current", get(current_config))
        // 运行状态
        .route("/api/system/supervision", get(supervision_report))
        .with_state(state)
}

/// 带中间件的完整应用
pub fn create_app(state: AppState, cors_enabled: bool) -> Router {
    let router = create_routes(state)
        .layer(middleware::from_fn(request_logging))
        .layer(trace_layer());
    if cors_enabled {
        router.layer(cors_layer())
    } else {
        router
    }
}
