use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use fleet::Application;
use fleet_core::{AppConfig, NodeRole};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 等待受监督进程退出的最长时间
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("fleet")
        .version("1.0.0")
        .about("分布式集群控制平面")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认路径查找"),
        )
        .arg(
            Arg::new("role")
                .short('r')
                .long("role")
                .value_name("ROLE")
                .help("节点角色，覆盖配置文件")
                .value_parser(["full", "client"]),
        )
        .arg(
            Arg::new("node-id")
                .long("node-id")
                .value_name("ID")
                .help("节点ID，覆盖配置文件"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");

    // 加载配置
    let mut config = AppConfig::load(config_path.map(String::as_str)).with_context(|| {
        format!(
            "加载配置文件失败: {}",
            config_path.map(String::as_str).unwrap_or("<默认路径>")
        )
    })?;

    if let Some(role) = matches.get_one::<String>("role") {
        config.node.role = parse_role(role)?;
    }
    if let Some(id) = matches.get_one::<String>("node-id") {
        config.node.id = id.clone();
    }

    // 初始化日志系统
    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| config.observability.log_level.clone());
    let log_format = matches
        .get_one::<String>("log-format")
        .map(String::as_str)
        .unwrap_or("pretty");
    init_logging(&log_level, log_format)?;

    info!("启动分布式集群控制平面");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    if config.observability.metrics_enabled {
        fleet_infrastructure::init_metrics(&config.observability.metrics_bind_address)
            .context("初始化指标导出失败")?;
    }

    let app = Application::new(config).await?;
    app.start().await?;

    // 等待关闭信号
    wait_for_shutdown_signal().await;

    info!("收到关闭信号，开始优雅关闭...");
    if app.shutdown(SHUTDOWN_TIMEOUT).await {
        info!("节点已优雅关闭");
    } else {
        warn!("节点关闭超时，强制退出");
    }

    info!("分布式集群控制平面已退出");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

fn parse_role(role: &str) -> Result<NodeRole> {
    match role {
        "full" => Ok(NodeRole::Full),
        "client" => Ok(NodeRole::Client),
        _ => Err(anyhow::anyhow!("不支持的节点角色: {role}")),
    }
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("监听Ctrl+C信号失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
