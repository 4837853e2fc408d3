use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info};

use executr_domain::repositories::JobRepository;
use executr_errors::ExecutrResult;

/// 保留期清理配置
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// 清理间隔（秒）
    pub cleanup_interval_seconds: u64,
    /// 终态作业保留时长（秒），completed_at 早于 now - retention 的行被删除
    pub job_retention_seconds: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: 3600, // 1小时
            job_retention_seconds: 48 * 3600, // 48小时
        }
    }
}

/// 保留期清理服务
///
/// 周期性删除超过保留期的终态作业，防止表无限增长。
/// 尝试记录通过外键级联删除。
pub struct CleanupService {
    job_repo: Arc<dyn JobRepository>,
    config: CleanupConfig,
}

impl CleanupService {
    pub fn new(job_repo: Arc<dyn JobRepository>, config: CleanupConfig) -> Self {
        Self { job_repo, config }
    }

    /// 运行清理循环，收到关闭信号后在下一个 tick 退出
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "启动保留期清理循环, 间隔 {}s, 保留 {}s",
            self.config.cleanup_interval_seconds, self.config.job_retention_seconds
        );

        let mut tick = interval(Duration::from_secs(self.config.cleanup_interval_seconds));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.cleanup_once().await {
                        error!("保留期清理失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("保留期清理循环收到关闭信号");
                    break;
                }
            }
        }
    }

    /// 执行一轮清理，返回删除行数
    pub async fn cleanup_once(&self) -> ExecutrResult<u64> {
        let retention = ChronoDuration::seconds(self.config.job_retention_seconds);
        let deleted = self.job_repo.delete_terminal_older_than(retention).await?;

        if deleted > 0 {
            info!("清理过期作业 {} 条", deleted);
            metrics::counter!("executr_jobs_cleaned_total").increment(deleted);
        } else {
            debug!("没有超过保留期的作业");
        }

        Ok(deleted)
    }
}
