use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info};

use executr_domain::repositories::JobRepository;
use executr_errors::ExecutrResult;

/// 重试提升配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 扫描间隔（秒）
    pub tick_interval_seconds: u64,
    /// 每轮最多提升的作业数
    pub batch_size: i64,
    /// 基础退避间隔（秒）
    pub base_interval_seconds: i64,
    /// 退避上限（秒）
    pub max_interval_seconds: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 30,
            batch_size: 10,
            base_interval_seconds: 60,   // 1分钟
            max_interval_seconds: 3600,  // 1小时
        }
    }
}

/// 重试提升服务
///
/// 周期性把满足条件的 failed 作业提升回 pending：
/// retry_count < max_retries 且 retry_after 为空或已过。
/// 提升是条件更新，并发的人工操作不会造成重复提升。
pub struct RetryService {
    job_repo: Arc<dyn JobRepository>,
    config: RetryConfig,
}

impl RetryService {
    pub fn new(job_repo: Arc<dyn JobRepository>, config: RetryConfig) -> Self {
        Self { job_repo, config }
    }

    /// 运行重试循环，收到关闭信号后在下一个 tick 退出
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "启动重试提升循环, 间隔 {}s, 每轮至多 {} 条",
            self.config.tick_interval_seconds, self.config.batch_size
        );

        let mut tick = interval(Duration::from_secs(self.config.tick_interval_seconds));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.promote_once().await {
                        error!("重试提升扫描失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("重试提升循环收到关闭信号");
                    break;
                }
            }
        }
    }

    /// 执行一轮提升，返回实际提升的作业数
    pub async fn promote_once(&self) -> ExecutrResult<usize> {
        let retriable = self.job_repo.find_retriable(self.config.batch_size).await?;
        if retriable.is_empty() {
            return Ok(0);
        }

        let mut promoted = 0usize;
        for job in retriable {
            let retry_after = self.next_retry_after(job.retry_count);
            match self.job_repo.promote_retry(job.id, retry_after).await {
                Ok(true) => {
                    info!(
                        "重试作业: {} 类型: {} 第 {}/{} 次, 下次提升门槛: {}",
                        job.id,
                        job.job_type,
                        job.retry_count + 1,
                        job.max_retries,
                        retry_after.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                    promoted += 1;
                    metrics::counter!("executr_jobs_retried_total").increment(1);
                }
                Ok(false) => {
                    // 扫描与提升之间条件已不满足
                    debug!("作业 {} 不再满足重试条件，跳过", job.id);
                }
                Err(e) => {
                    error!("提升重试作业 {} 失败: {}", job.id, e);
                }
            }
        }

        Ok(promoted)
    }

    /// 计算下一次提升门槛：now + base · 2^retry_count，封顶 max_interval
    fn next_retry_after(&self, retry_count: i32) -> DateTime<Utc> {
        // 移位量封顶防止溢出，封顶后的值必然超过 max_interval
        let shift = retry_count.clamp(0, 30) as u32;
        let exponential = self.config.base_interval_seconds.saturating_mul(1i64 << shift);
        let capped = exponential.min(self.config.max_interval_seconds);
        Utc::now() + ChronoDuration::seconds(capped)
    }
}
