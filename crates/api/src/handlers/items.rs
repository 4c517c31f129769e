use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use fleet_core::{
    ApiResponse, CancelItemResponse, CompleteItemRequest, FailItemRequest, QueueStatus,
    RequestItemsRequest, SubmitItemRequest, SubmitItemResponse, WorkItem,
};

use crate::{
    error::{ApiError, ApiResult},
    response::{created, success},
    state::AppState,
};

/// 单次拉取请求允许的最长挂起时间
const MAX_REQUEST_WAIT: Duration = Duration::from_secs(60);

pub async fn submit_item(
    State(state): State<AppState>,
    Json(request): Json<SubmitItemRequest>,
) -> Result<(StatusCode, Json<ApiResponse<SubmitItemResponse>>), ApiError> {
    let item_id = state
        .queue()?
        .submit(&request.item_type, request.payload)
        .await?;
    Ok(created(SubmitItemResponse { item_id }))
}

pub async fn get_item(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
) -> ApiResult<WorkItem> {
    let item = state
        .queue()?
        .get_item(&item_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("工作项 {item_id}")))?;
    Ok(success(item))
}

pub async fn cancel_item(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
) -> ApiResult<CancelItemResponse> {
    let cancelled = state.queue()?.cancel(&item_id).await?;
    Ok(success(CancelItemResponse { cancelled }))
}

pub async fn request_items(
    State(state): State<AppState>,
    Json(request): Json<RequestItemsRequest>,
) -> ApiResult<Vec<WorkItem>> {
    let wait = Duration::from_millis(request.wait_ms).min(MAX_REQUEST_WAIT);
    let items = state
        .queue()?
        .request_items(&request.node_id, request.max_count, wait)
        .await?;
    Ok(success(items))
}

pub async fn complete_item(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    Json(request): Json<CompleteItemRequest>,
) -> ApiResult<()> {
    state
        .queue()?
        .report_completion(&item_id, request.result, request.duration_ms)
        .await?;
    Ok(success(()))
}

pub async fn fail_item(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    Json(request): Json<FailItemRequest>,
) -> ApiResult<()> {
    state
        .queue()?
        .report_failure(&item_id, &request.error)
        .await?;
    Ok(success(()))
}

pub async fn queue_status(State(state): State<AppState>) -> ApiResult<QueueStatus> {
    Ok(success(state.queue()?.get_status().await))
}
