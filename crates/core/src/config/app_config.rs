use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::sections::{
    ApiConfig, DistributionConfig, NodeConfig, ObservabilityConfig, QueueConfig, StorageConfig,
    SupervisorConfig, TopologyConfig, WorkerConfig,
};

/// 默认配置文件查找路径
const DEFAULT_CONFIG_PATHS: [&str; 3] = ["config/fleet.toml", "fleet.toml", "/etc/fleet/config.toml"];

/// 节点配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub topology: TopologyConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub distribution: DistributionConfig,
    pub supervisor: SupervisorConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序:
    /// 1. 默认值
    /// 2. 配置文件 (TOML)
    /// 3. 环境变量覆盖 (前缀 FLEET，层级分隔符 `__`，例如 `FLEET_TOPOLOGY__HEARTBEAT_INTERVAL_SECONDS`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else if let Some(path) = DEFAULT_CONFIG_PATHS.iter().find(|p| Path::new(p).exists()) {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("FLEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.node.validate().context("节点配置验证失败")?;
        self.topology.validate().context("拓扑配置验证失败")?;
        self.queue.validate().context("工作队列配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.distribution
            .validate()
            .context("配置分发配置验证失败")?;
        self.supervisor.validate().context("监督配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        self.storage.validate().context("存储配置验证失败")?;
        Ok(())
    }
}
