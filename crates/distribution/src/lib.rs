//! 配置分发：控制端发布与推送，客户端校验与应用

pub mod applier;
pub mod local;
pub mod service;

pub use applier::{ApplyOutcome, BundleHandler, ConfigApplier, SettingsHandler};
pub use local::LocalConfigClient;
pub use service::{DistributionService, DistributionServiceConfig};
