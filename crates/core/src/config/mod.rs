//! 配置模块
//!
//! 分层加载：默认值 → TOML 文件 → `FLEET_` 前缀的环境变量。

pub mod app_config;
pub mod sections;

pub use app_config::AppConfig;
pub use sections::*;
