use axum::{
    extract::{Path, State},
    Json,
};
use fleet_core::{ConfigBundle, DistributionRecord, PublishRequest};
use fleet_distribution::ApplyOutcome;
use serde::Serialize;

use crate::{
    error::ApiResult,
    response::{success, success_with_message},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct ApplyResponse {
    pub version: String,
    pub applied: bool,
}

pub async fn publish_config(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> ApiResult<ConfigBundle> {
    let bundle = state
        .distribution()?
        .publish(request.content.into_bytes(), request.version)
        .await?;
    let message = format!("配置版本 {} 已发布", bundle.version);
    Ok(success_with_message(bundle, message))
}

pub async fn sync_config(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ApiResult<DistributionRecord> {
    let record = state.distribution()?.sync_to(&node_id).await?;
    Ok(success(record))
}

pub async fn distribution_history(
    State(state): State<AppState>,
) -> ApiResult<Vec<DistributionRecord>> {
    Ok(success(state.distribution()?.get_distribution_history().await))
}

/// 客户端接收控制端推送的配置包
pub async fn apply_config(
    State(state): State<AppState>,
    Json(bundle): Json<ConfigBundle>,
) -> ApiResult<ApplyResponse> {
    let outcome = state.applier()?.apply(&bundle).await?;
    Ok(success(ApplyResponse {
        version: bundle.version,
        applied: outcome == ApplyOutcome::Applied,
    }))
}

/// 本节点当前的配置，客户端取已应用的版本，控制端取已发布的版本
pub async fn current_config(State(state): State<AppState>) -> ApiResult<Option<ConfigBundle>> {
    if let Some(applier) = &state.applier {
        return Ok(success(applier.current_bundle().await));
    }
    Ok(success(state.distribution()?.current_bundle().await))
}
