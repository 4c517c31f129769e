//! 节点的 HTTP 接口：拓扑、工作队列、配置分发和运行状态

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::{create_app, create_routes};
pub use state::AppState;
