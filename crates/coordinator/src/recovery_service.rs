use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use executr_domain::entities::AttemptStatus;
use executr_domain::repositories::{JobAttemptRepository, JobRepository};
use executr_errors::ExecutrResult;

/// 过期恢复配置
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// 扫描间隔（秒）
    pub tick_interval_seconds: u64,
    /// 心跳超时（秒）：last_heartbeat 早于 now - timeout 的 running 作业视为过期
    pub heartbeat_timeout_seconds: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 5,
            heartbeat_timeout_seconds: 15,
        }
    }
}

/// 过期作业恢复服务
///
/// 周期性扫描心跳超时的 running 作业并条件重置回 pending。
/// 重置以 status='running' 为条件，与并发 complete/fail 的竞争是良性的：
/// 先落终态的一方胜出，另一方静默落空。
pub struct RecoveryService {
    job_repo: Arc<dyn JobRepository>,
    attempt_repo: Arc<dyn JobAttemptRepository>,
    config: RecoveryConfig,
}

impl RecoveryService {
    pub fn new(
        job_repo: Arc<dyn JobRepository>,
        attempt_repo: Arc<dyn JobAttemptRepository>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            job_repo,
            attempt_repo,
            config,
        }
    }

    /// 运行恢复循环，收到关闭信号后在下一个 tick 退出
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "启动过期恢复循环, 间隔 {}s, 心跳超时 {}s",
            self.config.tick_interval_seconds, self.config.heartbeat_timeout_seconds
        );

        let mut tick = interval(Duration::from_secs(self.config.tick_interval_seconds));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.recover_once().await {
                        error!("过期作业扫描失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("过期恢复循环收到关闭信号");
                    break;
                }
            }
        }
    }

    /// 执行一轮过期恢复，返回实际重置的作业数
    pub async fn recover_once(&self) -> ExecutrResult<usize> {
        let timeout = ChronoDuration::seconds(self.config.heartbeat_timeout_seconds);
        let stale_jobs = self.job_repo.find_stale(timeout).await?;

        if stale_jobs.is_empty() {
            return Ok(0);
        }

        let mut reset = 0usize;
        for job in stale_jobs {
            match self.job_repo.reset_stale(job.id).await {
                Ok(true) => {
                    info!(
                        "重置过期作业: {} 执行器: {:?}",
                        job.id,
                        job.executor_id.as_deref()
                    );
                    reset += 1;
                    metrics::counter!("executr_jobs_stale_reset_total").increment(1);

                    // 把悬空的尝试记录收尾为 timeout
                    if let Err(e) = self
                        .attempt_repo
                        .close(job.id, AttemptStatus::Timeout, Some("心跳超时，作业被重置"))
                        .await
                    {
                        warn!("关闭作业 {} 的过期尝试失败: {}", job.id, e);
                    }
                }
                Ok(false) => {
                    // 扫描与重置之间作业已落终态
                    debug!("作业 {} 已不处于 running，跳过重置", job.id);
                }
                Err(e) => {
                    error!("重置过期作业 {} 失败: {}", job.id, e);
                }
            }
        }

        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use executr_domain::entities::JobStatus;
    use executr_testing::{JobBuilder, MockJobAttemptRepository, MockJobRepository};

    fn service(
        jobs: Arc<MockJobRepository>,
        attempts: Arc<MockJobAttemptRepository>,
    ) -> RecoveryService {
        RecoveryService::new(jobs, attempts, RecoveryConfig::default())
    }

    #[test]
    fn test_recovery_config_default() {
        let config = RecoveryConfig::default();
        assert_eq!(config.tick_interval_seconds, 5);
        assert_eq!(config.heartbeat_timeout_seconds, 15);
    }

    #[tokio::test]
    async fn test_stale_job_is_reset_and_attempt_closed() {
        let jobs = Arc::new(MockJobRepository::new());
        let attempts = Arc::new(MockJobAttemptRepository::new());

        let stale_heartbeat = Utc::now() - ChronoDuration::seconds(60);
        let job = JobBuilder::new().running("exec-a", stale_heartbeat).build();
        jobs.insert(job.clone());
        attempts.record(job.id, "exec-a", "10.0.0.1").await.unwrap();

        let reset = service(jobs.clone(), attempts.clone())
            .recover_once()
            .await
            .unwrap();
        assert_eq!(reset, 1);

        let recovered = jobs.get(job.id).unwrap();
        assert_eq!(recovered.status, JobStatus::Pending);
        assert!(recovered.executor_id.is_none());
        assert!(recovered.started_at.is_none());
        assert!(recovered.last_heartbeat.is_none());

        let closed = attempts.list_for_job(job.id).await.unwrap();
        assert_eq!(closed[0].status, AttemptStatus::Timeout);
        assert!(closed[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn test_fresh_job_is_not_reset() {
        let jobs = Arc::new(MockJobRepository::new());
        let attempts = Arc::new(MockJobAttemptRepository::new());

        let job = JobBuilder::new().running("exec-a", Utc::now()).build();
        jobs.insert(job.clone());

        let reset = service(jobs.clone(), attempts)
            .recover_once()
            .await
            .unwrap();
        assert_eq!(reset, 0);
        assert_eq!(jobs.get(job.id).unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown_signal() {
        let jobs = Arc::new(MockJobRepository::new());
        let attempts = Arc::new(MockJobAttemptRepository::new());
        let svc = service(jobs, attempts);

        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let handle = tokio::spawn(async move { svc.run(rx).await });

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("恢复循环应在关闭信号后退出")
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_and_terminal_jobs_ignored() {
        let jobs = Arc::new(MockJobRepository::new());
        let attempts = Arc::new(MockJobAttemptRepository::new());

        jobs.insert(JobBuilder::new().build());
        jobs.insert(
            JobBuilder::new()
                .with_status(JobStatus::Completed)
                .build(),
        );

        let reset = service(jobs, attempts).recover_once().await.unwrap();
        assert_eq!(reset, 0);
    }
}
