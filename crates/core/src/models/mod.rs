//! # 数据模型
//!
//! 控制平面的核心数据结构：节点、拓扑快照、工作项、配置包以及 HTTP 接口结构。
//!
//! 所有时间字段使用 `DateTime<Utc>`，状态字段使用枚举，全部实现 serde 序列化，
//! 既用于持久化也用于网络传输。
//!
//! ```text
//! WorkItem: pending → active → completed | failed
//!                       ↓
//!                    pending (孤儿回收)
//! ```

pub mod api;
pub mod bundle;
pub mod node;
pub mod topology;
pub mod work_item;

pub use api::*;
pub use bundle::*;
pub use node::*;
pub use topology::*;
pub use work_item::*;
