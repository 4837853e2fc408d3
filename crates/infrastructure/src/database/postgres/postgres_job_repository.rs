use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use executr_domain::{
    entities::{CompleteRequest, FailRequest, Job, JobFilter, JobSubmission},
    repositories::{
        ExecutorSnapshot, JobRepository, PriorityCount, StatusCount, TransitionOutcome,
    },
};
use executr_errors::ExecutrResult;

const JOB_COLUMNS: &str = "id, type, binary_url, binary_sha256, arguments, env_variables, \
     priority, status, executor_id, stdout, stderr, exit_code, error_message, \
     retry_count, max_retries, retry_after, created_at, started_at, completed_at, last_heartbeat";

pub struct PostgresJobRepository {
    pool: PgPool,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::postgres::PgRow) -> ExecutrResult<Job> {
        let env_variables: HashMap<String, String> = row
            .try_get::<Option<serde_json::Value>, _>("env_variables")?
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        Ok(Job {
            id: row.try_get("id")?,
            job_type: row.try_get("type")?,
            binary_url: row.try_get("binary_url")?,
            binary_sha256: row.try_get("binary_sha256")?,
            arguments: row.try_get("arguments")?,
            env_variables,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            executor_id: row.try_get("executor_id")?,
            stdout: row.try_get("stdout")?,
            stderr: row.try_get("stderr")?,
            exit_code: row.try_get("exit_code")?,
            error_message: row.try_get("error_message")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            retry_after: row.try_get("retry_after")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
        })
    }

    /// 条件更新未命中时区分 404 / 400
    async fn classify_miss(&self, id: uuid::Uuid) -> ExecutrResult<TransitionOutcome> {
        let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Ok(TransitionOutcome::InvalidState)
        } else {
            Ok(TransitionOutcome::NotFound)
        }
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    #[instrument(skip(self, submission), fields(job_type = %submission.job_type))]
    async fn create(&self, submission: &JobSubmission) -> ExecutrResult<Job> {
        let env_json = serde_json::to_value(&submission.env_variables)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (type, binary_url, binary_sha256, arguments, env_variables, priority, max_retries)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(&submission.job_type)
        .bind(&submission.binary_url)
        .bind(&submission.binary_sha256)
        .bind(&submission.arguments)
        .bind(env_json)
        .bind(submission.priority)
        .bind(submission.max_retries)
        .fetch_one(&self.pool)
        .await?;

        let job = Self::row_to_job(&row)?;
        debug!("创建作业成功: {} 类型: {}", job.id, job.job_type);
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn get_by_id(&self, id: uuid::Uuid) -> ExecutrResult<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list(&self, filter: &JobFilter) -> ExecutrResult<Vec<Job>> {
        // limit 默认 100，上限 1000
        let limit = filter.limit.unwrap_or(100).clamp(1, 1000);
        let offset = filter.offset.unwrap_or(0).max(0);

        let status = filter.status.map(|s| s.as_str()).unwrap_or("");
        let job_type = filter.job_type.as_deref().unwrap_or("");
        let priority = filter.priority.map(|p| p.as_str()).unwrap_or("");

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1 = '' OR status = $1)
              AND ($2 = '' OR type = $2)
              AND ($3 = '' OR priority = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        ))
        .bind(status)
        .bind(job_type)
        .bind(priority)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn cancel(&self, id: uuid::Uuid) -> ExecutrResult<TransitionOutcome> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', completed_at = now() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!("作业已取消: {}", id);
            Ok(TransitionOutcome::Applied)
        } else {
            self.classify_miss(id).await
        }
    }

    #[instrument(skip(self), fields(executor_id = %executor_id))]
    async fn claim(&self, executor_id: &str) -> ExecutrResult<Option<Job>> {
        // 子查询用 FOR UPDATE SKIP LOCKED 选出唯一候选行：
        // 并发认领者不会在同一行上串行等待，也不会拿到同一个作业
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'running', executor_id = $1, started_at = now(), last_heartbeat = now()
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending'
                ORDER BY
                    CASE priority
                        WHEN 'foreground' THEN 1
                        WHEN 'background' THEN 2
                        ELSE 3
                    END,
                    created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(executor_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id, executor_id = %executor_id))]
    async fn heartbeat(&self, id: uuid::Uuid, executor_id: &str) -> ExecutrResult<()> {
        // 属主或状态不匹配时静默无效果
        sqlx::query(
            "UPDATE jobs SET last_heartbeat = now() \
             WHERE id = $1 AND status = 'running' AND executor_id = $2",
        )
        .bind(id)
        .bind(executor_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, req), fields(job_id = %id))]
    async fn complete(
        &self,
        id: uuid::Uuid,
        req: &CompleteRequest,
    ) -> ExecutrResult<TransitionOutcome> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', stdout = $2, stderr = $3, exit_code = $4, \
             completed_at = now() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(&req.stdout)
        .bind(&req.stderr)
        .bind(req.exit_code)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            Ok(TransitionOutcome::Applied)
        } else {
            self.classify_miss(id).await
        }
    }

    #[instrument(skip(self, req), fields(job_id = %id))]
    async fn fail(&self, id: uuid::Uuid, req: &FailRequest) -> ExecutrResult<TransitionOutcome> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', error_message = $2, stdout = $3, stderr = $4, \
             exit_code = $5, completed_at = now() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(&req.error_message)
        .bind(&req.stdout)
        .bind(&req.stderr)
        .bind(req.exit_code)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            Ok(TransitionOutcome::Applied)
        } else {
            self.classify_miss(id).await
        }
    }

    #[instrument(skip(self))]
    async fn find_stale(&self, timeout: Duration) -> ExecutrResult<Vec<Job>> {
        let cutoff = Utc::now() - timeout;
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'running' AND last_heartbeat < $1",
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn reset_stale(&self, id: uuid::Uuid) -> ExecutrResult<bool> {
        // status='running' 条件保证与并发 complete/fail 竞争时不会回退终态
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', executor_id = NULL, started_at = NULL, \
             last_heartbeat = NULL \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_terminal_older_than(&self, retention: Duration) -> ExecutrResult<u64> {
        let cutoff = Utc::now() - retention;
        let result = sqlx::query(
            "DELETE FROM jobs \
             WHERE status IN ('completed', 'failed', 'cancelled') AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn find_retriable(&self, limit: i64) -> ExecutrResult<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'failed' AND retry_count < max_retries \
               AND (retry_after IS NULL OR retry_after <= now()) \
             ORDER BY completed_at \
             LIMIT $1",
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn promote_retry(
        &self,
        id: uuid::Uuid,
        retry_after: DateTime<Utc>,
    ) -> ExecutrResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', retry_count = retry_count + 1, \
             retry_after = $2, stdout = NULL, stderr = NULL, exit_code = NULL, \
             error_message = NULL, executor_id = NULL, started_at = NULL, \
             completed_at = NULL, last_heartbeat = NULL \
             WHERE id = $1 AND status = 'failed' AND retry_count < max_retries",
        )
        .bind(id)
        .bind(retry_after)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_by_status(&self) -> ExecutrResult<Vec<StatusCount>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM jobs GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StatusCount {
                    status: row.try_get("status")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }

    async fn count_pending_by_priority(&self) -> ExecutrResult<Vec<PriorityCount>> {
        let rows = sqlx::query(
            "SELECT priority, COUNT(*) AS count FROM jobs \
             WHERE status = 'pending' GROUP BY priority ORDER BY priority",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PriorityCount {
                    priority: row.try_get("priority")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }

    async fn active_executors(&self) -> ExecutrResult<Vec<ExecutorSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT j.executor_id, j.id AS job_id, j.type AS job_type, j.last_heartbeat,
                   (SELECT COUNT(*) FROM job_attempts a
                    WHERE a.executor_id = j.executor_id AND a.status = 'completed') AS jobs_completed
            FROM jobs j
            WHERE j.status = 'running' AND j.executor_id IS NOT NULL
            ORDER BY j.last_heartbeat DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ExecutorSnapshot {
                    executor_id: row.try_get("executor_id")?,
                    current_job_id: row.try_get("job_id")?,
                    job_type: row.try_get("job_type")?,
                    last_heartbeat: row.try_get("last_heartbeat")?,
                    jobs_completed: row.try_get("jobs_completed")?,
                })
            })
            .collect()
    }
}
