//! 控制平面的基础设施实现：持久化、审计、节点间 HTTP 客户端和指标导出

pub mod audit;
pub mod http;
pub mod memory;
pub mod observability;
pub mod storage;

pub use audit::*;
pub use http::*;
pub use memory::*;
pub use observability::*;
pub use storage::*;
