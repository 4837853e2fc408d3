use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use executr_domain::{
    entities::{AttemptStatus, JobAttempt},
    repositories::JobAttemptRepository,
};
use executr_errors::ExecutrResult;

const ATTEMPT_COLUMNS: &str =
    "id, job_id, executor_id, executor_ip, started_at, ended_at, status, error_message";

pub struct PostgresJobAttemptRepository {
    pool: PgPool,
}

impl PostgresJobAttemptRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_attempt(row: &sqlx::postgres::PgRow) -> ExecutrResult<JobAttempt> {
        Ok(JobAttempt {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            executor_id: row.try_get("executor_id")?,
            executor_ip: row.try_get("executor_ip")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            status: row.try_get("status")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

#[async_trait]
impl JobAttemptRepository for PostgresJobAttemptRepository {
    #[instrument(skip(self), fields(job_id = %job_id, executor_id = %executor_id))]
    async fn record(
        &self,
        job_id: Uuid,
        executor_id: &str,
        executor_ip: &str,
    ) -> ExecutrResult<JobAttempt> {
        let row = sqlx::query(&format!(
            "INSERT INTO job_attempts (job_id, executor_id, executor_ip) \
             VALUES ($1, $2, $3) RETURNING {ATTEMPT_COLUMNS}",
        ))
        .bind(job_id)
        .bind(executor_id)
        .bind(executor_ip)
        .fetch_one(&self.pool)
        .await?;

        let attempt = Self::row_to_attempt(&row)?;
        debug!("记录执行尝试: {} 作业: {}", attempt.id, job_id);
        Ok(attempt)
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn list_for_job(&self, job_id: Uuid) -> ExecutrResult<Vec<JobAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM job_attempts \
             WHERE job_id = $1 ORDER BY started_at DESC",
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_attempt).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn close(
        &self,
        job_id: Uuid,
        status: AttemptStatus,
        error_message: Option<&str>,
    ) -> ExecutrResult<()> {
        // 只关闭尚未结束的尝试，重复关闭为无操作
        sqlx::query(
            "UPDATE job_attempts SET status = $2, ended_at = now(), error_message = $3 \
             WHERE job_id = $1 AND ended_at IS NULL",
        )
        .bind(job_id)
        .bind(status)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
