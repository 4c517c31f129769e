use axum::{extract::State, Json};
use chrono::Utc;
use fleet_core::{ApiResponse, HealthReport, NodeDescriptor};

use crate::{response::success, state::AppState};

/// 存活探测，同时报告本节点负载
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthReport>> {
    success(HealthReport {
        status: "ok".to_string(),
        node_id: state.node.id.clone(),
        active_item_count: state.active_item_count(),
        timestamp: Utc::now(),
    })
}

/// 本节点描述，供种子发现使用
pub async fn node_info(State(state): State<AppState>) -> Json<ApiResponse<NodeDescriptor>> {
    success(state.node.clone())
}
