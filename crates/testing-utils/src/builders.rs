//! Test data builders for creating test entities
//!
//! Builder patterns with sensible defaults and easy customization.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use executr_domain::entities::{Job, JobPriority, JobStatus};

/// Builder for creating test Job entities
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self {
            job: Job {
                id: Uuid::new_v4(),
                job_type: "test-job".to_string(),
                binary_url: "http://127.0.0.1:1/bin".to_string(),
                binary_sha256: "ab".repeat(32),
                arguments: Vec::new(),
                env_variables: HashMap::new(),
                priority: JobPriority::Background,
                status: JobStatus::Pending,
                executor_id: None,
                stdout: None,
                stderr: None,
                exit_code: None,
                error_message: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                last_heartbeat: None,
                retry_count: 0,
                max_retries: 0,
                retry_after: None,
            },
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.job.id = id;
        self
    }

    pub fn with_type(mut self, job_type: &str) -> Self {
        self.job.job_type = job_type.to_string();
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.job.priority = priority;
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.job.status = status;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.job.created_at = created_at;
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.job.arguments = arguments;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.job.max_retries = max_retries;
        self
    }

    pub fn with_retry_count(mut self, retry_count: i32) -> Self {
        self.job.retry_count = retry_count;
        self
    }

    pub fn with_retry_after(mut self, retry_after: DateTime<Utc>) -> Self {
        self.job.retry_after = Some(retry_after);
        self
    }

    /// running 状态并带上属主与心跳时间戳
    pub fn running(mut self, executor_id: &str, last_heartbeat: DateTime<Utc>) -> Self {
        self.job.status = JobStatus::Running;
        self.job.executor_id = Some(executor_id.to_string());
        self.job.started_at = Some(last_heartbeat);
        self.job.last_heartbeat = Some(last_heartbeat);
        self
    }

    /// failed 状态并落 completed_at
    pub fn failed(mut self, error_message: &str, completed_at: DateTime<Utc>) -> Self {
        self.job.status = JobStatus::Failed;
        self.job.error_message = Some(error_message.to_string());
        self.job.completed_at = Some(completed_at);
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self::new()
    }
}
