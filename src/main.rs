use anyhow::{Context, Result};
use clap::{Arg, Command};
use orchestrator::{from_async_fn, AppConfig, InvocationContext, Orchestrator, ShutdownManager};
use orchestrator_config::LogFormat;
use serde_json::{json, Map};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("orchestrator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("进程内任务与工作流编排引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认路径查找"),
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
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("heartbeat-cron")
                .long("heartbeat-cron")
                .value_name("CRON")
                .help("心跳定时任务的 CRON 表达式")
                .default_value("*/5 * * * *"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = AppConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("<默认路径>")))?;

    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| config.observability.log_level.clone());
    let log_format = matches
        .get_one::<String>("log-format")
        .map(String::as_str)
        .unwrap_or(config.observability.log_format.as_str());
    init_logging(&log_level, log_format)?;

    info!("启动任务编排引擎");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    let orchestrator = Orchestrator::new(config);
    orchestrator.start().await.context("启动编排器失败")?;

    let heartbeat_cron = matches
        .get_one::<String>("heartbeat-cron")
        .map(String::as_str)
        .unwrap_or("*/5 * * * *");
    register_heartbeat(&orchestrator, heartbeat_cron).await?;

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");

    let shutdown_manager = ShutdownManager::new();
    if !shutdown_manager.graceful_stop(orchestrator.stop()).await {
        warn!("编排器未能在超时时间内停止");
    }

    info!("任务编排引擎已退出");
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
            return Err(anyhow::anyhow!(
                "不支持的日志格式: {log_format}，可选 {} 或 {}",
                LogFormat::Json.as_str(),
                LogFormat::Pretty.as_str()
            ));
        }
    }

    Ok(())
}

/// 注册周期性输出运行状态的心跳任务
async fn register_heartbeat(orchestrator: &Orchestrator, cron_expr: &str) -> Result<()> {
    let observed = orchestrator.clone();
    let heartbeat = from_async_fn("heartbeat", move |_ctx: InvocationContext| {
        let observed = observed.clone();
        async move {
            let health = observed.health_check().await;
            let metrics = observed.get_metrics().await;
            info!(
                status = ?health.status,
                tasks = metrics.tasks.total,
                workflows = metrics.workflows.total,
                scheduled = metrics.cron.total,
                events = metrics.events.total,
                "Orchestrator heartbeat"
            );
            Ok(json!({ "status": health.status }))
        }
    });

    let id = orchestrator
        .create_scheduled_task("heartbeat", cron_expr, heartbeat, Vec::new(), Map::new(), None, None)
        .await
        .with_context(|| format!("注册心跳任务失败: {cron_expr}"))?;
    info!("心跳任务已注册 (ID: {}, 表达式 '{}')", id, cron_expr);
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
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
