use std::time::Duration;

use anyhow::{Context, Result};
use clap::ArgMatches;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统
pub fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
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

/// 取配置值：环境变量优先于命令行标志
pub fn string_value(matches: &ArgMatches, flag: &str, env: &str) -> Option<String> {
    if let Ok(value) = std::env::var(env) {
        if !value.is_empty() {
            return Some(value);
        }
    }
    matches.get_one::<String>(flag).cloned()
}

/// 必填配置值，环境变量与标志均缺失时报错
pub fn required_string(matches: &ArgMatches, flag: &str, env: &str) -> Result<String> {
    string_value(matches, flag, env)
        .ok_or_else(|| anyhow::anyhow!("缺少必填配置: --{flag} 或环境变量 {env}"))
}

/// 时长配置值（humantime 语法，如 5s / 30m / 1h）
pub fn duration_value(matches: &ArgMatches, flag: &str, env: &str) -> Result<Duration> {
    let raw = string_value(matches, flag, env)
        .ok_or_else(|| anyhow::anyhow!("缺少配置: --{flag}"))?;
    humantime::parse_duration(&raw).with_context(|| format!("无法解析时长 --{flag}: {raw}"))
}

/// 整数配置值
pub fn u64_value(matches: &ArgMatches, flag: &str, env: &str) -> Result<u64> {
    let raw = string_value(matches, flag, env)
        .ok_or_else(|| anyhow::anyhow!("缺少配置: --{flag}"))?;
    raw.parse()
        .with_context(|| format!("无法解析整数 --{flag}: {raw}"))
}

/// 等待 Ctrl+C 或 SIGTERM
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.unwrap_or_else(|e| {
            error!("安装Ctrl+C信号处理器失败: {}", e);
            std::process::exit(1);
        })
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {}", e);
                std::process::exit(1);
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
