//! Mock implementations for the repository traits
//!
//! In-memory implementations mirroring the conditioned-update semantics of
//! the Postgres repositories closely enough for unit tests: claim ordering,
//! state-guarded transitions and owner-checked heartbeats.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use executr_domain::entities::{
    AttemptStatus, CompleteRequest, FailRequest, Job, JobAttempt, JobFilter, JobStatus,
    JobSubmission,
};
use executr_domain::repositories::{
    ExecutorSnapshot, JobAttemptRepository, JobRepository, PriorityCount, StatusCount,
    TransitionOutcome,
};
use executr_errors::{ExecutrError, ExecutrResult};

/// Mock implementation of JobRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockJobRepository {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
    fail_next: Arc<Mutex<bool>>,
}

impl MockJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(jobs: Vec<Job>) -> Self {
        let map = jobs.into_iter().map(|j| (j.id, j)).collect();
        Self {
            jobs: Arc::new(Mutex::new(map)),
            fail_next: Arc::new(Mutex::new(false)),
        }
    }

    pub fn insert(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    /// 让下一次调用返回数据库错误
    pub fn fail_next_call(&self) {
        *self.fail_next.lock().unwrap() = true;
    }

    fn check_fail(&self) -> ExecutrResult<()> {
        let mut flag = self.fail_next.lock().unwrap();
        if *flag {
            *flag = false;
            return Err(ExecutrError::database_error("mock database failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl JobRepository for MockJobRepository {
    async fn create(&self, submission: &JobSubmission) -> ExecutrResult<Job> {
        self.check_fail()?;
        let job = Job {
            id: Uuid::new_v4(),
            job_type: submission.job_type.clone(),
            binary_url: submission.binary_url.clone(),
            binary_sha256: submission.binary_sha256.clone(),
            arguments: submission.arguments.clone(),
            env_variables: submission.env_variables.clone(),
            priority: submission.priority,
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
            max_retries: submission.max_retries,
            retry_after: None,
        };
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_by_id(&self, id: Uuid) -> ExecutrResult<Option<Job>> {
        self.check_fail()?;
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> ExecutrResult<Vec<Job>> {
        self.check_fail()?;
        let limit = filter.limit.unwrap_or(100).clamp(1, 1000) as usize;
        let offset = filter.offset.unwrap_or(0).max(0) as usize;

        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .filter(|j| {
                filter
                    .job_type
                    .as_ref()
                    .is_none_or(|t| &j.job_type == t)
            })
            .filter(|j| filter.priority.is_none_or(|p| j.priority == p))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn cancel(&self, id: Uuid) -> ExecutrResult<TransitionOutcome> {
        self.check_fail()?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            None => Ok(TransitionOutcome::NotFound),
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                Ok(TransitionOutcome::Applied)
            }
            Some(_) => Ok(TransitionOutcome::InvalidState),
        }
    }

    async fn claim(&self, executor_id: &str) -> ExecutrResult<Option<Job>> {
        self.check_fail()?;
        let mut jobs = self.jobs.lock().unwrap();
        let candidate = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| (j.priority.claim_rank(), j.created_at))
            .map(|j| j.id);

        match candidate {
            None => Ok(None),
            Some(id) => {
                let job = jobs.get_mut(&id).expect("candidate disappeared");
                let now = Utc::now();
                job.status = JobStatus::Running;
                job.executor_id = Some(executor_id.to_string());
                job.started_at = Some(now);
                job.last_heartbeat = Some(now);
                Ok(Some(job.clone()))
            }
        }
    }

    async fn heartbeat(&self, id: Uuid, executor_id: &str) -> ExecutrResult<()> {
        self.check_fail()?;
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&id) {
            if job.status == JobStatus::Running && job.executor_id.as_deref() == Some(executor_id)
            {
                job.last_heartbeat = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn complete(&self, id: Uuid, req: &CompleteRequest) -> ExecutrResult<TransitionOutcome> {
        self.check_fail()?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            None => Ok(TransitionOutcome::NotFound),
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::Completed;
                job.stdout = Some(req.stdout.clone());
                job.stderr = Some(req.stderr.clone());
                job.exit_code = Some(req.exit_code);
                job.completed_at = Some(Utc::now());
                Ok(TransitionOutcome::Applied)
            }
            Some(_) => Ok(TransitionOutcome::InvalidState),
        }
    }

    async fn fail(&self, id: Uuid, req: &FailRequest) -> ExecutrResult<TransitionOutcome> {
        self.check_fail()?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            None => Ok(TransitionOutcome::NotFound),
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::Failed;
                job.error_message = Some(req.error_message.clone());
                job.stdout = req.stdout.clone();
                job.stderr = req.stderr.clone();
                job.exit_code = req.exit_code;
                job.completed_at = Some(Utc::now());
                Ok(TransitionOutcome::Applied)
            }
            Some(_) => Ok(TransitionOutcome::InvalidState),
        }
    }

    async fn find_stale(&self, timeout: Duration) -> ExecutrResult<Vec<Job>> {
        self.check_fail()?;
        let cutoff = Utc::now() - timeout;
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| {
                j.status == JobStatus::Running
                    && j.last_heartbeat.is_some_and(|hb| hb < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn reset_stale(&self, id: Uuid) -> ExecutrResult<bool> {
        self.check_fail()?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::Pending;
                job.executor_id = None;
                job.started_at = None;
                job.last_heartbeat = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_terminal_older_than(&self, retention: Duration) -> ExecutrResult<u64> {
        self.check_fail()?;
        let cutoff = Utc::now() - retention;
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(j.status.is_terminal() && j.completed_at.is_some_and(|c| c < cutoff))
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn find_retriable(&self, limit: i64) -> ExecutrResult<Vec<Job>> {
        self.check_fail()?;
        let now = Utc::now();
        let mut retriable: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| {
                j.status == JobStatus::Failed
                    && j.retry_count < j.max_retries
                    && j.retry_after.is_none_or(|ra| ra <= now)
            })
            .cloned()
            .collect();
        retriable.sort_by_key(|j| j.completed_at);
        retriable.truncate(limit.max(0) as usize);
        Ok(retriable)
    }

    async fn promote_retry(&self, id: Uuid, retry_after: DateTime<Utc>) -> ExecutrResult<bool> {
        self.check_fail()?;
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Failed && job.retry_count < job.max_retries => {
                job.status = JobStatus::Pending;
                job.retry_count += 1;
                job.retry_after = Some(retry_after);
                job.stdout = None;
                job.stderr = None;
                job.exit_code = None;
                job.error_message = None;
                job.executor_id = None;
                job.started_at = None;
                job.completed_at = None;
                job.last_heartbeat = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_by_status(&self) -> ExecutrResult<Vec<StatusCount>> {
        self.check_fail()?;
        let mut counts: HashMap<&'static str, i64> = HashMap::new();
        for job in self.jobs.lock().unwrap().values() {
            *counts.entry(job.status.as_str()).or_default() += 1;
        }
        let mut result: Vec<StatusCount> = counts
            .into_iter()
            .map(|(status, count)| StatusCount {
                status: status.to_string(),
                count,
            })
            .collect();
        result.sort_by(|a, b| a.status.cmp(&b.status));
        Ok(result)
    }

    async fn count_pending_by_priority(&self) -> ExecutrResult<Vec<PriorityCount>> {
        self.check_fail()?;
        let mut counts: HashMap<&'static str, i64> = HashMap::new();
        for job in self.jobs.lock().unwrap().values() {
            if job.status == JobStatus::Pending {
                *counts.entry(job.priority.as_str()).or_default() += 1;
            }
        }
        let mut result: Vec<PriorityCount> = counts
            .into_iter()
            .map(|(priority, count)| PriorityCount {
                priority: priority.to_string(),
                count,
            })
            .collect();
        result.sort_by(|a, b| a.priority.cmp(&b.priority));
        Ok(result)
    }

    async fn active_executors(&self) -> ExecutrResult<Vec<ExecutorSnapshot>> {
        self.check_fail()?;
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .filter_map(|j| {
                Some(ExecutorSnapshot {
                    executor_id: j.executor_id.clone()?,
                    current_job_id: Some(j.id),
                    job_type: Some(j.job_type.clone()),
                    last_heartbeat: j.last_heartbeat?,
                    jobs_completed: 0,
                })
            })
            .collect())
    }
}

/// Mock implementation of JobAttemptRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockJobAttemptRepository {
    attempts: Arc<Mutex<Vec<JobAttempt>>>,
}

impl MockJobAttemptRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<JobAttempt> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobAttemptRepository for MockJobAttemptRepository {
    async fn record(
        &self,
        job_id: Uuid,
        executor_id: &str,
        executor_ip: &str,
    ) -> ExecutrResult<JobAttempt> {
        let attempt = JobAttempt {
            id: Uuid::new_v4(),
            job_id,
            executor_id: executor_id.to_string(),
            executor_ip: executor_ip.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            status: AttemptStatus::Running,
            error_message: None,
        };
        self.attempts.lock().unwrap().push(attempt.clone());
        Ok(attempt)
    }

    async fn list_for_job(&self, job_id: Uuid) -> ExecutrResult<Vec<JobAttempt>> {
        let mut attempts: Vec<JobAttempt> = self
            .attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(attempts)
    }

    async fn close(
        &self,
        job_id: Uuid,
        status: AttemptStatus,
        error_message: Option<&str>,
    ) -> ExecutrResult<()> {
        let mut attempts = self.attempts.lock().unwrap();
        for attempt in attempts
            .iter_mut()
            .filter(|a| a.job_id == job_id && a.ended_at.is_none())
        {
            attempt.status = status;
            attempt.ended_at = Some(Utc::now());
            attempt.error_message = error_message.map(|s| s.to_string());
        }
        Ok(())
    }
}
