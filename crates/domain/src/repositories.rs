//! 领域仓储抽象
//!
//! 数据访问的抽象接口。所有状态转换都是单条、以先前状态为条件的更新，
//! 并发控制完全委托给存储层，进程内不持有作业状态锁。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{
    AttemptStatus, CompleteRequest, FailRequest, Job, JobAttempt, JobFilter, JobSubmission,
};
use executr_errors::ExecutrResult;

/// 条件更新的结果
///
/// 区分"行不存在"与"行存在但状态不满足条件"，上层据此映射 404 / 400。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// 更新生效
    Applied,
    /// 作业不存在
    NotFound,
    /// 作业存在但当前状态不允许该转换
    InvalidState,
}

/// 按状态统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

/// 待认领作业按优先级统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityCount {
    pub priority: String,
    pub count: i64,
}

/// 活跃执行器快照（来自 running 状态的作业行）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSnapshot {
    pub executor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub jobs_completed: i64,
}

/// 作业仓储抽象
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 插入一条 pending 作业并返回快照
    async fn create(&self, submission: &JobSubmission) -> ExecutrResult<Job>;

    async fn get_by_id(&self, id: Uuid) -> ExecutrResult<Option<Job>>;

    /// 按过滤器查询，created_at 从新到旧
    async fn list(&self, filter: &JobFilter) -> ExecutrResult<Vec<Job>>;

    /// pending → cancelled，同时落 completed_at
    async fn cancel(&self, id: Uuid) -> ExecutrResult<TransitionOutcome>;

    /// 原子认领：以跳过已锁行的行锁选出最高优先级、最早创建的 pending 行，
    /// 置为 running 并落 executor_id / started_at / last_heartbeat。
    /// 队列为空时返回 None。
    async fn claim(&self, executor_id: &str) -> ExecutrResult<Option<Job>>;

    /// 仅当作业处于 running 且属主匹配时刷新 last_heartbeat；
    /// 不匹配时静默成功（幂等，保护被强制重置后的过期执行器）。
    async fn heartbeat(&self, id: Uuid, executor_id: &str) -> ExecutrResult<()>;

    /// running → completed，落输出与 completed_at
    async fn complete(&self, id: Uuid, req: &CompleteRequest) -> ExecutrResult<TransitionOutcome>;

    /// running → failed，落错误信息与 completed_at
    async fn fail(&self, id: Uuid, req: &FailRequest) -> ExecutrResult<TransitionOutcome>;

    /// 查找 last_heartbeat 早于 now - timeout 的 running 作业
    async fn find_stale(&self, timeout: Duration) -> ExecutrResult<Vec<Job>>;

    /// running → pending 并清空 executor_id / started_at / last_heartbeat；
    /// 返回是否实际重置（与并发完成竞争时条件不再满足则为 false）
    async fn reset_stale(&self, id: Uuid) -> ExecutrResult<bool>;

    /// 删除 completed_at 早于 now - retention 的终态作业，返回删除行数
    async fn delete_terminal_older_than(&self, retention: Duration) -> ExecutrResult<u64>;

    /// 查找可重试的 failed 作业（retry_count < max_retries 且 retry_after 为空或已过）
    async fn find_retriable(&self, limit: i64) -> ExecutrResult<Vec<Job>>;

    /// failed → pending：清空结果字段、递增 retry_count、写入下次提升门槛；
    /// 以 status='failed' AND retry_count < max_retries 为条件防止重复提升
    async fn promote_retry(&self, id: Uuid, retry_after: DateTime<Utc>) -> ExecutrResult<bool>;

    async fn count_by_status(&self) -> ExecutrResult<Vec<StatusCount>>;

    async fn count_pending_by_priority(&self) -> ExecutrResult<Vec<PriorityCount>>;

    async fn active_executors(&self) -> ExecutrResult<Vec<ExecutorSnapshot>>;
}

/// 执行尝试仓储抽象
#[async_trait]
pub trait JobAttemptRepository: Send + Sync {
    /// 认领成功后记录一次尝试（status=running）
    async fn record(
        &self,
        job_id: Uuid,
        executor_id: &str,
        executor_ip: &str,
    ) -> ExecutrResult<JobAttempt>;

    /// 按作业查询全部尝试，started_at 从新到旧
    async fn list_for_job(&self, job_id: Uuid) -> ExecutrResult<Vec<JobAttempt>>;

    /// 结束该作业当前未关闭的尝试（ended_at 为空的行），落终态与错误信息
    async fn close(
        &self,
        job_id: Uuid,
        status: AttemptStatus,
        error_message: Option<&str>,
    ) -> ExecutrResult<()>;
}
