use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fleet_core::{ApiResponse, FleetError};
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("资源不存在: {0}")]
    NotFound(String),

    /// 本节点没有启用对应的组件
    #[error("本节点未启用{0}")]
    ComponentDisabled(&'static str),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Fleet(err) => match err {
                FleetError::NodeNotFound { .. } | FleetError::ItemNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                FleetError::NodeUnavailable { .. } | FleetError::NodeUnreachable { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                FleetError::StaleVersion { .. } => StatusCode::CONFLICT,
                FleetError::ChecksumMismatch { .. } | FleetError::InvalidBundle(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                FleetError::InvalidArgument(_)
                | FleetError::Serialization(_)
                | FleetError::ExecutorNotFound { .. } => StatusCode::BAD_REQUEST,
                FleetError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ComponentDisabled(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("请求处理失败: {}", self);
        }
        let body = ApiResponse::<()>::error(self.to_string());
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;
