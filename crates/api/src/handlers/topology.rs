use axum::{
    extract::{Path, State},
    Json,
};
use fleet_core::{HeartbeatAnnouncement, Node, NodeDescriptor, TopologySnapshot};

use crate::{error::ApiResult, response::success, state::AppState};

/// 节点主动上报心跳，未知节点按加入处理
pub async fn receive_heartbeat(
    State(state): State<AppState>,
    Json(announcement): Json<HeartbeatAnnouncement>,
) -> ApiResult<Node> {
    let node = state.topology()?.record_heartbeat(announcement).await?;
    Ok(success(node))
}

pub async fn get_topology(State(state): State<AppState>) -> ApiResult<TopologySnapshot> {
    let snapshot = state.topology()?.snapshot();
    Ok(success(snapshot.as_ref().clone()))
}

pub async fn join_node(
    State(state): State<AppState>,
    Json(descriptor): Json<NodeDescriptor>,
) -> ApiResult<Node> {
    let node = state.topology()?.join(descriptor).await?;
    Ok(success(node))
}

pub async fn remove_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<Node> {
    let node = state.topology()?.leave(&node_id).await?;
    Ok(success(node))
}
