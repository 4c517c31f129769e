//! 集群拓扑管理：成员、健康检测和按能力路由

pub mod manager;
pub mod routing;

pub use manager::{ProbeSummary, TopologyManager, TopologyManagerConfig};
pub use routing::select_least_loaded;
