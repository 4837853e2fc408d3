//! 执行器服务
//!
//! 启动时派生唯一身份并清扫上一代遗留的作业目录；随后以信号量
//! 约束的轮询循环认领作业，每个在途作业带独立的心跳泵。持续的
//! 网络失败超过阈值后停止认领，等在途作业自然排空。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Semaphore};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use executr_client::ExecutrClient;
use executr_domain::entities::{CompleteRequest, FailRequest, Job, JobResult};
use executr_errors::{ExecutrError, ExecutrResult};

use crate::cache::BinaryCache;
use crate::runner::JobRunner;

/// 执行器配置
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub server_url: String,
    /// 执行器名，必填，作为执行器 ID 的前缀
    pub name: String,
    pub cache_dir: String,
    pub work_dir: PathBuf,
    pub max_jobs: usize,
    pub poll_interval: Duration,
    pub max_cache_size_mb: u64,
    pub heartbeat_interval: Duration,
    pub network_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(server_url: &str, name: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            name: name.to_string(),
            cache_dir: "~/.executr/cache".to_string(),
            work_dir: PathBuf::from("/tmp/executr-jobs"),
            max_jobs: 1,
            poll_interval: Duration::from_secs(5),
            max_cache_size_mb: 400,
            heartbeat_interval: Duration::from_secs(5),
            network_timeout: Duration::from_secs(60),
        }
    }
}

/// 网络失败窗口：首次失败时开窗，任何一次成功交互关窗
struct FailureWindow {
    started: Option<Instant>,
}

impl FailureWindow {
    fn new() -> Self {
        Self { started: None }
    }

    /// 记录一次失败，返回窗口是否已超过阈值
    fn record_failure(&mut self, timeout: Duration) -> bool {
        let started = self.started.get_or_insert_with(Instant::now);
        started.elapsed() > timeout
    }

    fn clear(&mut self) {
        self.started = None;
    }
}

pub struct WorkerService {
    config: WorkerConfig,
    executor_id: String,
    executor_ip: String,
    client: Arc<ExecutrClient>,
    cache: Arc<BinaryCache>,
    semaphore: Arc<Semaphore>,
    // 优雅关闭不触碰子进程；该通道留给强制终止路径
    kill_tx: broadcast::Sender<()>,
}

impl WorkerService {
    pub fn new(mut config: WorkerConfig) -> ExecutrResult<Self> {
        if config.name.is_empty() {
            return Err(ExecutrError::config_error("执行器名不能为空"));
        }

        config.cache_dir = expand_home(&config.cache_dir)?;

        // 名称 + 新 UUID 的前 8 个十六进制字符，保证每个进程身份唯一
        let suffix: String = Uuid::new_v4().simple().to_string()[..8].to_string();
        let executor_id = format!("{}-{}", config.name, suffix);

        let executor_ip = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        let cache = BinaryCache::new(&config.cache_dir, config.max_cache_size_mb)?;
        std::fs::create_dir_all(&config.work_dir)?;

        let client = Arc::new(ExecutrClient::new(&config.server_url));
        let semaphore = Arc::new(Semaphore::new(config.max_jobs));
        let (kill_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            executor_id,
            executor_ip,
            client,
            cache: Arc::new(cache),
            semaphore,
            kill_tx,
        })
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    /// 向所有在途作业的子进程发送终止信号（强制关闭路径）。
    /// 优雅关闭不调用此方法。
    pub fn kill_running_jobs(&self) {
        let _ = self.kill_tx.send(());
    }

    /// 运行执行器直到收到关闭信号或网络静默超时。
    /// 关闭时立即停止认领，在途作业跑完后返回。
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "启动执行器: {} 并发上限: {} 缓存: {} 工作目录: {}",
            self.executor_id,
            self.config.max_jobs,
            self.config.cache_dir,
            self.config.work_dir.display()
        );

        self.scrub_work_dir();

        let mut tick = interval(self.config.poll_interval);
        let mut failure_window = FailureWindow::new();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    // 信号量满时丢弃本轮 tick，而不是排队
                    let permit = match self.semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            debug!("已达并发上限，跳过本轮认领");
                            continue;
                        }
                    };

                    match self.client.claim_next_job(&self.executor_id, &self.executor_ip).await {
                        Ok(Some(job)) => {
                            failure_window.clear();
                            info!(
                                "认领作业: {} 类型: {} 优先级: {:?}",
                                job.id, job.job_type, job.priority
                            );
                            let service = Arc::clone(&self);
                            // 作业只被强制终止通道取消，优雅关闭让它跑完
                            let job_kill = self.kill_tx.subscribe();
                            tokio::spawn(async move {
                                service.execute_job(job, job_kill).await;
                                drop(permit);
                            });
                        }
                        Ok(None) => {
                            failure_window.clear();
                            drop(permit);
                        }
                        Err(e) => {
                            drop(permit);
                            error!("认领作业失败: {}", e);
                            if failure_window.record_failure(self.config.network_timeout) {
                                error!(
                                    "网络失败持续超过 {:?}，停止认领新作业",
                                    self.config.network_timeout
                                );
                                break;
                            }
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("执行器收到关闭信号，停止认领");
                    break;
                }
            }
        }

        // 所有许可归还即全部在途作业结束
        info!("等待在途作业完成...");
        let _ = self
            .semaphore
            .acquire_many(self.config.max_jobs as u32)
            .await;
        info!("执行器退出完成: {}", self.executor_id);
    }

    /// 清空工作目录中上一代进程遗留的条目（尽力而为）
    fn scrub_work_dir(&self) {
        let entries = match std::fs::read_dir(&self.config.work_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("读取工作目录失败: {}", e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => debug!("清除遗留条目: {}", path.display()),
                Err(e) => warn!("清除遗留条目失败: {} ({})", path.display(), e),
            }
        }
    }

    /// 执行一个已认领的作业：建目录、起心跳泵、取二进制、运行、上报终态
    async fn execute_job(&self, job: Job, shutdown_rx: broadcast::Receiver<()>) {
        let job_dir = self.config.work_dir.join(job.id.to_string());

        // 心跳泵独立于运行器的阻塞等待
        let heartbeat_handle = {
            let client = Arc::clone(&self.client);
            let executor_id = self.executor_id.clone();
            let job_id = job.id;
            let heartbeat_interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut tick = interval(heartbeat_interval);
                loop {
                    tick.tick().await;
                    match client.heartbeat(job_id, &executor_id).await {
                        Ok(()) => debug!("心跳已发送: {}", job_id),
                        Err(e) => warn!("发送心跳失败: {} ({})", job_id, e),
                    }
                }
            })
        };

        let outcome = self.prepare_and_run(&job, &job_dir, shutdown_rx).await;
        heartbeat_handle.abort();

        // 作业目录用后即焚（尽力而为）
        if job_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&job_dir) {
                warn!("清理作业目录失败: {} ({})", job_dir.display(), e);
            }
        }

        self.report_outcome(&job, outcome).await;
    }

    /// 准备并运行：目录或二进制准备失败时返回诊断信息
    async fn prepare_and_run(
        &self,
        job: &Job,
        job_dir: &std::path::Path,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<JobResult, String> {
        if let Err(e) = std::fs::create_dir_all(job_dir) {
            error!("创建作业目录失败: {} ({})", job.id, e);
            return Err(format!("Failed to create job directory: {e}"));
        }

        let binary_path = self
            .cache
            .get_binary(&job.binary_url, &job.binary_sha256)
            .await
            .map_err(|e| {
                error!("获取二进制失败: {} ({})", job.id, e);
                format!("Failed to get binary: {e}")
            })?;

        let runner = JobRunner {
            job_id: job.id.to_string(),
            binary_path,
            arguments: job.arguments.clone(),
            env_vars: job.env_variables.clone(),
            work_dir: job_dir.to_path_buf(),
        };
        Ok(runner.execute(shutdown_rx).await)
    }

    /// 上报终态；失败只记 WARN 不重试——协调器的过期恢复循环
    /// 会把没有收到终态上报的作业重置回 pending
    async fn report_outcome(&self, job: &Job, outcome: Result<JobResult, String>) {
        match outcome {
            Ok(result) if result.exit_code == 0 => {
                let req = CompleteRequest {
                    executor_id: self.executor_id.clone(),
                    stdout: result.stdout,
                    stderr: result.stderr,
                    exit_code: result.exit_code,
                };
                match self.client.complete_job(job.id, &req).await {
                    Ok(()) => info!("作业完成: {} 退出码: 0", job.id),
                    Err(e) => warn!("上报作业完成失败: {} ({})", job.id, e),
                }
            }
            Ok(result) => {
                let req = FailRequest {
                    executor_id: self.executor_id.clone(),
                    error_message: "Job failed with non-zero exit code".to_string(),
                    stdout: Some(result.stdout),
                    stderr: Some(result.stderr),
                    exit_code: Some(result.exit_code),
                };
                match self.client.fail_job(job.id, &req).await {
                    Ok(()) => info!("作业失败: {} 退出码: {}", job.id, result.exit_code),
                    Err(e) => warn!("上报作业失败失败: {} ({})", job.id, e),
                }
            }
            Err(diagnostic) => {
                let req = FailRequest {
                    executor_id: self.executor_id.clone(),
                    error_message: diagnostic.clone(),
                    stdout: None,
                    stderr: Some(diagnostic),
                    exit_code: Some(-1),
                };
                match self.client.fail_job(job.id, &req).await {
                    Ok(()) => info!("作业准备失败: {}", job.id),
                    Err(e) => warn!("上报作业失败失败: {} ({})", job.id, e),
                }
            }
        }
    }
}

/// 把 ~/ 前缀展开为当前用户家目录
fn expand_home(path: &str) -> ExecutrResult<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME")
            .map_err(|_| ExecutrError::config_error("无法确定家目录，HOME 未设置"))?;
        Ok(format!("{home}/{rest}"))
    } else {
        Ok(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> WorkerConfig {
        let mut config = WorkerConfig::new("http://127.0.0.1:1", "test-worker");
        config.cache_dir = dir.join("cache").to_string_lossy().into_owned();
        config.work_dir = dir.join("work");
        config
    }

    #[test]
    fn test_executor_id_format() {
        let dir = tempfile::tempdir().unwrap();
        let worker = WorkerService::new(test_config(dir.path())).unwrap();

        let id = worker.executor_id();
        let suffix = id.strip_prefix("test-worker-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_executor_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let a = WorkerService::new(test_config(dir.path())).unwrap();
        let b = WorkerService::new(test_config(dir.path())).unwrap();
        assert_ne!(a.executor_id(), b.executor_id());
    }

    #[test]
    fn test_empty_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.name = String::new();
        assert!(WorkerService::new(config).is_err());
    }

    #[test]
    fn test_expand_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(expand_home("~/.executr/cache").unwrap(), "/home/tester/.executr/cache");
        assert_eq!(expand_home("/abs/path").unwrap(), "/abs/path");
    }

    #[test]
    fn test_scrub_work_dir_removes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.work_dir).unwrap();
        // 上一代进程遗留的作业目录与散落文件
        std::fs::create_dir_all(config.work_dir.join("11111111-2222-3333-4444-555555555555"))
            .unwrap();
        std::fs::write(config.work_dir.join("stray.log"), b"leftover").unwrap();

        let worker = WorkerService::new(config.clone()).unwrap();
        worker.scrub_work_dir();

        assert_eq!(std::fs::read_dir(&config.work_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_failure_window_opens_and_clears() {
        let mut window = FailureWindow::new();
        // 窗口刚开，不会立即超时
        assert!(!window.record_failure(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(20));
        // 阈值极小则超时
        assert!(window.record_failure(Duration::from_millis(1)));
        // 成功交互关窗后重新计时
        window.clear();
        assert!(!window.record_failure(Duration::from_secs(60)));
    }

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::new("http://localhost:8080", "w");
        assert_eq!(config.max_jobs, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_cache_size_mb, 400);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.network_timeout, Duration::from_secs(60));
        assert_eq!(config.cache_dir, "~/.executr/cache");
    }
}
