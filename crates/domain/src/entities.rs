//! 领域实体
//!
//! 作业（Job）是系统的工作单元：一个可下载的二进制及其参数与环境。
//! 执行尝试（JobAttempt）是某个执行器对作业一次托管的只追加记录。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// 作业优先级与状态
// ============================================================================

/// 作业优先级
///
/// 认领时 foreground < background < best_effort（排名 1/2/3），
/// 同优先级按 created_at 从旧到新。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobPriority {
    #[serde(rename = "foreground")]
    Foreground,
    #[serde(rename = "background")]
    Background,
    #[serde(rename = "best_effort")]
    BestEffort,
}

impl JobPriority {
    /// 认领排序使用的排名，数值越小越先被认领
    pub fn claim_rank(&self) -> i16 {
        match self {
            JobPriority::Foreground => 1,
            JobPriority::Background => 2,
            JobPriority::BestEffort => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Foreground => "foreground",
            JobPriority::Background => "background",
            JobPriority::BestEffort => "best_effort",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "foreground" => Some(JobPriority::Foreground),
            "background" => Some(JobPriority::Background),
            "best_effort" => Some(JobPriority::BestEffort),
            _ => None,
        }
    }
}

// SQLx 数据库类型支持 - JobPriority
impl sqlx::Type<sqlx::Postgres> for JobPriority {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for JobPriority {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        JobPriority::parse(s).ok_or_else(|| format!("Invalid job priority: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for JobPriority {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 作业状态
///
/// 状态转换构成 DAG：pending → {running, cancelled}；
/// running → {completed, failed, pending(过期重置)}；
/// failed → pending（重试提升，retry_count < max_retries 时）；
/// completed 与 cancelled 为终态。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// 是否为终态（保留期清理的对象）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// 状态机 DAG 允许的转换
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Pending)
                | (JobStatus::Failed, JobStatus::Pending)
        )
    }
}

// SQLx 数据库类型支持 - JobStatus
impl sqlx::Type<sqlx::Postgres> for JobStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for JobStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        JobStatus::parse(s).ok_or_else(|| format!("Invalid job status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for JobStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

// ============================================================================
// 作业实体
// ============================================================================

/// 作业
///
/// 不可变描述符（type/binary_url/binary_sha256/arguments/env/priority/max_retries）
/// 在提交时确定；状态与结果字段由协调器按条件更新维护。
/// 所有时间戳均为 UTC。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub binary_url: String,
    pub binary_sha256: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub env_variables: HashMap<String, String>,
    pub priority: JobPriority,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    // 重试状态为服务端内部字段，不出现在线格式中
    #[serde(skip)]
    pub retry_count: i32,
    #[serde(skip)]
    pub max_retries: i32,
    #[serde(skip)]
    pub retry_after: Option<DateTime<Utc>>,
}

impl Job {
    /// 是否还有剩余重试额度
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 作业执行结果（执行器本地）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// 作业快照加其全部执行尝试（get 接口的响应形态）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    #[serde(default)]
    pub attempts: Vec<JobAttempt>,
}

// ============================================================================
// 执行尝试
// ============================================================================

/// 执行尝试状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttemptStatus {
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "timeout")]
    Timeout,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Running => "running",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(AttemptStatus::Running),
            "completed" => Some(AttemptStatus::Completed),
            "failed" => Some(AttemptStatus::Failed),
            "timeout" => Some(AttemptStatus::Timeout),
            _ => None,
        }
    }
}

// SQLx 数据库类型支持 - AttemptStatus
impl sqlx::Type<sqlx::Postgres> for AttemptStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for AttemptStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        AttemptStatus::parse(s).ok_or_else(|| format!("Invalid attempt status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for AttemptStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 一次执行托管记录
///
/// 认领成功时创建；托管结束（完成/失败/心跳超时）时更新一次。
/// 一个作业在重试或过期重置后会累积多条尝试记录。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttempt {
    pub id: Uuid,
    pub job_id: Uuid,
    pub executor_id: String,
    pub executor_ip: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ============================================================================
// 请求与过滤器
// ============================================================================

/// 作业提交请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    #[serde(rename = "type")]
    pub job_type: String,
    pub binary_url: String,
    #[serde(default)]
    pub binary_sha256: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub env_variables: HashMap<String, String>,
    pub priority: JobPriority,
    #[serde(default)]
    pub max_retries: i32,
}

/// 作业查询过滤器，条件为合取，空条件匹配全部
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub priority: Option<JobPriority>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// 执行器认领请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub executor_id: String,
    pub executor_ip: String,
}

/// 心跳请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub executor_id: String,
}

/// 作业完成上报
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub executor_id: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: i32,
}

/// 作业失败上报
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRequest {
    pub executor_id: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}
