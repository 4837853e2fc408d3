//! executr - 分布式作业执行系统
//!
//! `executr coordinator` 运行协调器（作业 API + 后台循环），
//! `executr worker` 运行执行器。所有配置项都有对应的 EXECUTR_*
//! 环境变量，环境变量优先于命令行标志。

mod app;
mod common;
mod shutdown;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use tracing::{error, info};

use crate::app::{run_coordinator, run_worker, CoordinatorConfig};
use crate::common::{
    duration_value, init_logging, required_string, string_value, u64_value,
    wait_for_shutdown_signal,
};
use crate::shutdown::ShutdownManager;
use executr_worker::WorkerConfig;

fn cli() -> Command {
    Command::new("executr")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式作业执行系统")
        .subcommand_required(true)
        .subcommand(
            Command::new("coordinator")
                .about("运行协调器（作业 API 与后台循环）")
                .arg(Arg::new("db-url").long("db-url").value_name("URL").help("PostgreSQL 连接串"))
                .arg(
                    Arg::new("port")
                        .long("port")
                        .value_name("PORT")
                        .help("HTTP 监听端口")
                        .default_value("8080"),
                )
                .arg(
                    Arg::new("cleanup-interval")
                        .long("cleanup-interval")
                        .value_name("DURATION")
                        .help("保留期清理频率（如 30m, 1h）")
                        .default_value("1h"),
                )
                .arg(
                    Arg::new("job-retention")
                        .long("job-retention")
                        .value_name("DURATION")
                        .help("终态作业保留时长（如 24h, 48h）")
                        .default_value("48h"),
                )
                .arg(
                    Arg::new("heartbeat-timeout")
                        .long("heartbeat-timeout")
                        .value_name("DURATION")
                        .help("过期作业心跳超时（如 15s, 30s）")
                        .default_value("15s"),
                )
                .arg(log_level_arg())
                .arg(log_format_arg()),
        )
        .subcommand(
            Command::new("worker")
                .about("运行作业执行器")
                .arg(
                    Arg::new("server-url")
                        .long("server-url")
                        .value_name("URL")
                        .help("协调器 API 地址"),
                )
                .arg(
                    Arg::new("name")
                        .long("name")
                        .value_name("NAME")
                        .help("执行器名（作为执行器 ID 前缀）"),
                )
                .arg(
                    Arg::new("cache-dir")
                        .long("cache-dir")
                        .value_name("DIR")
                        .help("二进制缓存目录")
                        .default_value("~/.executr/cache"),
                )
                .arg(
                    Arg::new("work-dir")
                        .long("work-dir")
                        .value_name("DIR")
                        .help("作业工作目录根")
                        .default_value("/tmp/executr-jobs"),
                )
                .arg(
                    Arg::new("max-jobs")
                        .long("max-jobs")
                        .value_name("N")
                        .help("最大并发作业数")
                        .default_value("1"),
                )
                .arg(
                    Arg::new("poll-interval")
                        .long("poll-interval")
                        .value_name("DURATION")
                        .help("作业轮询频率（如 5s, 10s）")
                        .default_value("5s"),
                )
                .arg(
                    Arg::new("max-cache-size")
                        .long("max-cache-size")
                        .value_name("MB")
                        .help("缓存大小上限（MB）")
                        .default_value("400"),
                )
                .arg(
                    Arg::new("heartbeat-interval")
                        .long("heartbeat-interval")
                        .value_name("DURATION")
                        .help("心跳频率（如 5s, 10s）")
                        .default_value("5s"),
                )
                .arg(
                    Arg::new("network-timeout")
                        .long("network-timeout")
                        .value_name("DURATION")
                        .help("持续网络失败多久后停止认领（如 60s, 2m）")
                        .default_value("60s"),
                )
                .arg(log_level_arg())
                .arg(log_format_arg()),
        )
}

fn log_level_arg() -> Arg {
    Arg::new("log-level")
        .long("log-level")
        .value_name("LEVEL")
        .help("日志级别")
        .value_parser(["trace", "debug", "info", "warn", "error"])
        .default_value("info")
}

fn log_format_arg() -> Arg {
    Arg::new("log-format")
        .long("log-format")
        .value_name("FORMAT")
        .help("日志格式")
        .value_parser(["json", "pretty"])
        .default_value("pretty")
}

fn coordinator_config(matches: &ArgMatches) -> Result<CoordinatorConfig> {
    Ok(CoordinatorConfig {
        db_url: required_string(matches, "db-url", "EXECUTR_DB_URL")?,
        port: u64_value(matches, "port", "EXECUTR_PORT")? as u16,
        cleanup_interval: duration_value(matches, "cleanup-interval", "EXECUTR_CLEANUP_INTERVAL")?,
        job_retention: duration_value(matches, "job-retention", "EXECUTR_JOB_RETENTION")?,
        heartbeat_timeout: duration_value(
            matches,
            "heartbeat-timeout",
            "EXECUTR_HEARTBEAT_TIMEOUT",
        )?,
    })
}

fn worker_config(matches: &ArgMatches) -> Result<WorkerConfig> {
    let server_url = required_string(matches, "server-url", "EXECUTR_SERVER_URL")?;
    let name = required_string(matches, "name", "EXECUTR_NAME")?;

    let mut config = WorkerConfig::new(&server_url, &name);
    if let Some(cache_dir) = string_value(matches, "cache-dir", "EXECUTR_CACHE_DIR") {
        config.cache_dir = cache_dir;
    }
    if let Some(work_dir) = string_value(matches, "work-dir", "EXECUTR_WORK_DIR") {
        config.work_dir = PathBuf::from(work_dir);
    }
    config.max_jobs = u64_value(matches, "max-jobs", "EXECUTR_MAX_JOBS")?.max(1) as usize;
    config.poll_interval = duration_value(matches, "poll-interval", "EXECUTR_POLL_INTERVAL")?;
    config.max_cache_size_mb = u64_value(matches, "max-cache-size", "EXECUTR_MAX_CACHE_SIZE")?;
    config.heartbeat_interval =
        duration_value(matches, "heartbeat-interval", "EXECUTR_HEARTBEAT_INTERVAL")?;
    config.network_timeout = duration_value(matches, "network-timeout", "EXECUTR_NETWORK_TIMEOUT")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let (name, sub_matches) = matches.subcommand().expect("subcommand required");
    let log_level = string_value(sub_matches, "log-level", "EXECUTR_LOG_LEVEL")
        .unwrap_or_else(|| "info".to_string());
    let log_format = string_value(sub_matches, "log-format", "EXECUTR_LOG_FORMAT")
        .unwrap_or_else(|| "pretty".to_string());
    init_logging(&log_level, &log_format)?;

    let shutdown = ShutdownManager::new();

    // 应用任务与信号等待并行
    let mut app_handle = {
        let shutdown = shutdown.clone();
        let name = name.to_string();
        let sub_matches = sub_matches.clone();
        tokio::spawn(async move {
            let result = match name.as_str() {
                "coordinator" => match coordinator_config(&sub_matches) {
                    Ok(config) => run_coordinator(config, &shutdown).await,
                    Err(e) => Err(e),
                },
                "worker" => match worker_config(&sub_matches) {
                    Ok(config) => run_worker(config, &shutdown).await,
                    Err(e) => Err(e),
                },
                other => Err(anyhow::anyhow!("未知子命令: {other}")),
            };
            if let Err(e) = &result {
                error!("服务运行失败: {e:#}");
            }
            result
        })
    };

    // 应用提前退出（配置错误、网络静默）或收到信号
    tokio::select! {
        result = &mut app_handle => {
            return result?;
        }
        _ = wait_for_shutdown_signal() => {
            info!("开始优雅关闭...");
            shutdown.shutdown().await;
        }
    }

    app_handle.await??;
    info!("executr 已退出");
    Ok(())
}
