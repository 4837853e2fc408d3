use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use executr_api::{create_routes, AppState};
use executr_coordinator::{
    CleanupConfig, CleanupService, RecoveryConfig, RecoveryService, RetryConfig, RetryService,
};
use executr_infrastructure::{
    DatabaseManager, PostgresJobAttemptRepository, PostgresJobRepository,
};
use executr_worker::{WorkerConfig, WorkerService};

use crate::common::wait_for_shutdown_signal;
use crate::shutdown::ShutdownManager;

/// 协调器配置
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub db_url: String,
    pub port: u16,
    pub cleanup_interval: Duration,
    pub job_retention: Duration,
    pub heartbeat_timeout: Duration,
}

/// 运行协调器：HTTP API + 三个后台循环。
/// 收到关闭信号后 HTTP 服务排空连接（30 秒期限），后台循环在下一个 tick 退出。
pub async fn run_coordinator(
    config: CoordinatorConfig,
    shutdown: &ShutdownManager,
) -> Result<()> {
    // Prometheus recorder 全进程安装一次
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("安装指标 recorder 失败: {e}"))?;

    let db = DatabaseManager::new(&config.db_url, 10)
        .await
        .context("连接数据库失败")?;
    db.run_migrations().await.context("数据库迁移失败")?;

    let job_repo = Arc::new(PostgresJobRepository::new(db.pool()));
    let attempt_repo = Arc::new(PostgresJobAttemptRepository::new(db.pool()));

    // 后台循环
    let recovery = RecoveryService::new(
        job_repo.clone(),
        attempt_repo.clone(),
        RecoveryConfig {
            heartbeat_timeout_seconds: config.heartbeat_timeout.as_secs() as i64,
            ..RecoveryConfig::default()
        },
    );
    let cleanup = CleanupService::new(
        job_repo.clone(),
        CleanupConfig {
            cleanup_interval_seconds: config.cleanup_interval.as_secs().max(1),
            job_retention_seconds: config.job_retention.as_secs() as i64,
        },
    );
    let retry = RetryService::new(job_repo.clone(), RetryConfig::default());

    let recovery_handle = {
        let rx = shutdown.subscribe().await;
        tokio::spawn(async move { recovery.run(rx).await })
    };
    let cleanup_handle = {
        let rx = shutdown.subscribe().await;
        tokio::spawn(async move { cleanup.run(rx).await })
    };
    let retry_handle = {
        let rx = shutdown.subscribe().await;
        tokio::spawn(async move { retry.run(rx).await })
    };

    // HTTP 服务
    let state = AppState::new(job_repo, attempt_repo, Some(metrics_handle));
    let app = create_routes(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("绑定地址失败: {bind_addr}"))?;
    info!("协调器启动在 http://{}", bind_addr);

    let mut graceful_rx = shutdown.subscribe().await;
    let mut server_handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = graceful_rx.recv().await;
            info!("HTTP 服务收到关闭信号");
        });
        if let Err(e) = server.await {
            error!("HTTP 服务运行失败: {}", e);
        }
    });

    // 等待关闭信号或服务自身退出
    let mut shutdown_rx = shutdown.subscribe().await;
    tokio::select! {
        _ = shutdown_rx.recv() => {
            // 排空连接，超时强制停止
            if tokio::time::timeout(Duration::from_secs(30), &mut server_handle)
                .await
                .is_err()
            {
                warn!("HTTP 服务关闭超时，强制停止");
                server_handle.abort();
            }
        }
        _ = &mut server_handle => {
            warn!("HTTP 服务提前退出");
        }
    }

    let _ = tokio::join!(recovery_handle, cleanup_handle, retry_handle);
    db.close().await;
    info!("协调器已退出");
    Ok(())
}

/// 运行执行器。
/// 第一次关闭信号停止认领并等在途作业排空；排空期间再次收到
/// OS 信号则向子进程发送终止信号。
pub async fn run_worker(config: WorkerConfig, shutdown: &ShutdownManager) -> Result<()> {
    let worker = Arc::new(WorkerService::new(config).context("创建执行器失败")?);
    info!("执行器身份: {}", worker.executor_id());

    let mut worker_handle = tokio::spawn(Arc::clone(&worker).run(shutdown.subscribe().await));

    // 第一阶段：正常运行直到收到关闭信号（或执行器自行退出，如网络静默超时）
    let mut shutdown_rx = shutdown.subscribe().await;
    tokio::select! {
        result = &mut worker_handle => {
            result.context("执行器任务异常退出")?;
            return Ok(());
        }
        _ = shutdown_rx.recv() => {}
    }

    // 第二阶段：排空在途作业；再来一次信号则强制终止子进程
    tokio::select! {
        result = &mut worker_handle => {
            result.context("执行器任务异常退出")?;
        }
        _ = wait_for_shutdown_signal() => {
            warn!("再次收到信号，强制终止在途作业的子进程");
            worker.kill_running_jobs();
            worker_handle.await.context("执行器任务异常退出")?;
        }
    }

    Ok(())
}
