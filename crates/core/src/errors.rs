use thiserror::Error;

/// 控制平面错误类型定义
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("节点不可达: {node} - {reason}")]
    NodeUnreachable { node: String, reason: String },

    #[error("节点未找到: {id}")]
    NodeNotFound { id: String },

    #[error("节点不可用: {id}")]
    NodeUnavailable { id: String },

    #[error("配置包校验和不匹配: 期望 {expected}, 实际 {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("无效的配置包: {0}")]
    InvalidBundle(String),

    #[error("配置版本过旧: {version} (当前版本: {current})")]
    StaleVersion { version: String, current: String },

    #[error("工作项未找到: {id}")]
    ItemNotFound { id: String },

    #[error("进程 {process} 重启次数超出预算: {window_seconds}秒内最多重启 {max_restarts} 次")]
    RestartBudgetExceeded {
        process: String,
        max_restarts: u32,
        window_seconds: u64,
    },

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("未注册的执行器: {item_type}")]
    ExecutorNotFound { item_type: String },

    #[error("执行错误: {0}")]
    Execution(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("无效的请求参数: {0}")]
    InvalidArgument(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type FleetResult<T> = std::result::Result<T, FleetError>;

impl FleetError {
    pub fn node_unreachable<N: Into<String>, R: Into<String>>(node: N, reason: R) -> Self {
        Self::NodeUnreachable {
            node: node.into(),
            reason: reason.into(),
        }
    }
    pub fn node_not_found<S: Into<String>>(id: S) -> Self {
        Self::NodeNotFound { id: id.into() }
    }
    pub fn node_unavailable<S: Into<String>>(id: S) -> Self {
        Self::NodeUnavailable { id: id.into() }
    }
    pub fn item_not_found<S: Into<String>>(id: S) -> Self {
        Self::ItemNotFound { id: id.into() }
    }
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// 对端级别的瞬时故障，由调用方转换为拓扑/队列状态变化而不是向上抛出
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FleetError::NodeUnreachable { .. }
                | FleetError::NodeUnavailable { .. }
                | FleetError::Timeout(_)
                | FleetError::Network(_)
        )
    }

    /// 只有重启预算耗尽会让组件停机
    pub fn is_fatal(&self) -> bool {
        matches!(self, FleetError::RestartBudgetExceeded { .. })
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        FleetError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for FleetError {
    fn from(err: anyhow::Error) -> Self {
        FleetError::Internal(err.to_string())
    }
}
