//! PostgreSQL 仓储集成测试
//!
//! 需要一个可用的 PostgreSQL 实例，通过 EXECUTR_TEST_DATABASE_URL 指定；
//! 未设置时全部测试直接跳过。

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::Duration;
use sqlx::PgPool;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use executr_domain::{
    entities::{AttemptStatus, CompleteRequest, FailRequest, JobFilter, JobPriority, JobStatus,
        JobSubmission},
    repositories::{JobAttemptRepository, JobRepository, TransitionOutcome},
};
use executr_infrastructure::{PostgresJobAttemptRepository, PostgresJobRepository};

// 所有测试共享同一数据库，串行执行避免认领互相干扰
static DB_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

async fn test_pool() -> Option<(PgPool, MutexGuard<'static, ()>)> {
    let url = match std::env::var("EXECUTR_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("EXECUTR_TEST_DATABASE_URL 未设置，跳过集成测试");
            return None;
        }
    };

    let guard = DB_LOCK.get_or_init(|| Mutex::new(())).lock().await;

    let pool = PgPool::connect(&url).await.expect("连接测试数据库失败");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("迁移失败");
    sqlx::query("DELETE FROM jobs")
        .execute(&pool)
        .await
        .expect("清理 jobs 表失败");

    Some((pool, guard))
}

fn submission(job_type: &str, priority: JobPriority) -> JobSubmission {
    JobSubmission {
        job_type: job_type.to_string(),
        binary_url: "http://127.0.0.1:1/bin".to_string(),
        binary_sha256: "ab".repeat(32),
        arguments: vec!["arg1".to_string(), "arg2".to_string()],
        env_variables: HashMap::from([("TEST_ENV".to_string(), "x".to_string())]),
        priority,
        max_retries: 0,
    }
}

#[tokio::test]
async fn test_create_and_get_roundtrip() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    let repo = PostgresJobRepository::new(pool);

    let created = repo
        .create(&submission("roundtrip", JobPriority::Background))
        .await
        .unwrap();
    assert_eq!(created.status, JobStatus::Pending);
    assert_eq!(created.job_type, "roundtrip");
    assert!(created.executor_id.is_none());

    let fetched = repo.get_by_id(created.id).await.unwrap().unwrap();
    assert_eq!(fetched.id, created.id);
    assert_eq!(fetched.arguments, vec!["arg1", "arg2"]);
    assert_eq!(fetched.env_variables.get("TEST_ENV").unwrap(), "x");

    assert!(repo.get_by_id(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_priority_and_age_ordering() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    let repo = PostgresJobRepository::new(pool);

    // 提交顺序与认领顺序相反
    let best_effort = repo
        .create(&submission("order", JobPriority::BestEffort))
        .await
        .unwrap();
    let background = repo
        .create(&submission("order", JobPriority::Background))
        .await
        .unwrap();
    let foreground = repo
        .create(&submission("order", JobPriority::Foreground))
        .await
        .unwrap();

    let first = repo.claim("exec-a").await.unwrap().unwrap();
    let second = repo.claim("exec-a").await.unwrap().unwrap();
    let third = repo.claim("exec-a").await.unwrap().unwrap();

    assert_eq!(first.id, foreground.id);
    assert_eq!(second.id, background.id);
    assert_eq!(third.id, best_effort.id);
    assert!(repo.claim("exec-a").await.unwrap().is_none());

    // 认领后的行已带上执行器与时间戳
    assert_eq!(first.status, JobStatus::Running);
    assert_eq!(first.executor_id.as_deref(), Some("exec-a"));
    assert!(first.started_at.is_some());
    assert!(first.last_heartbeat.is_some());
}

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    let repo = std::sync::Arc::new(PostgresJobRepository::new(pool));

    for _ in 0..4 {
        repo.create(&submission("exclusive", JobPriority::Background))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..8 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.claim(&format!("exec-{i}")).await.unwrap()
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            claimed.push(job.id);
        }
    }

    // 4 个作业恰好被认领 4 次，无重复
    assert_eq!(claimed.len(), 4);
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), 4);
}

#[tokio::test]
async fn test_cancel_transitions() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    let repo = PostgresJobRepository::new(pool);

    let job = repo
        .create(&submission("cancel", JobPriority::Background))
        .await
        .unwrap();

    assert_eq!(repo.cancel(job.id).await.unwrap(), TransitionOutcome::Applied);
    let cancelled = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    // 非 pending 再取消 → InvalidState；不存在 → NotFound
    assert_eq!(
        repo.cancel(job.id).await.unwrap(),
        TransitionOutcome::InvalidState
    );
    assert_eq!(
        repo.cancel(Uuid::new_v4()).await.unwrap(),
        TransitionOutcome::NotFound
    );

    // 已取消的作业不可被认领
    assert!(repo.claim("exec-a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_heartbeat_owner_check() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    let repo = PostgresJobRepository::new(pool);

    let job = repo
        .create(&submission("heartbeat", JobPriority::Background))
        .await
        .unwrap();
    let claimed = repo.claim("owner").await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    let initial = claimed.last_heartbeat.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // 属主心跳推进时间戳
    repo.heartbeat(job.id, "owner").await.unwrap();
    let after_owner = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert!(after_owner.last_heartbeat.unwrap() > initial);

    // 非属主心跳静默无效果
    let before = after_owner.last_heartbeat.unwrap();
    repo.heartbeat(job.id, "impostor").await.unwrap();
    let after_impostor = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(after_impostor.last_heartbeat.unwrap(), before);
}

#[tokio::test]
async fn test_complete_and_fail_guards() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    let repo = PostgresJobRepository::new(pool);

    let job = repo
        .create(&submission("terminal", JobPriority::Background))
        .await
        .unwrap();

    // pending 状态不允许 complete
    let req = CompleteRequest {
        executor_id: "exec-a".to_string(),
        stdout: "out".to_string(),
        stderr: String::new(),
        exit_code: 0,
    };
    assert_eq!(
        repo.complete(job.id, &req).await.unwrap(),
        TransitionOutcome::InvalidState
    );

    repo.claim("exec-a").await.unwrap().unwrap();
    assert_eq!(
        repo.complete(job.id, &req).await.unwrap(),
        TransitionOutcome::Applied
    );

    let completed = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.stdout.as_deref(), Some("out"));
    assert_eq!(completed.exit_code, Some(0));
    assert!(completed.completed_at.is_some());

    // 终态后 fail 不生效
    let fail_req = FailRequest {
        executor_id: "exec-a".to_string(),
        error_message: "boom".to_string(),
        stdout: None,
        stderr: None,
        exit_code: Some(42),
    };
    assert_eq!(
        repo.fail(job.id, &fail_req).await.unwrap(),
        TransitionOutcome::InvalidState
    );
}

#[tokio::test]
async fn test_stale_scan_and_reset() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    let repo = PostgresJobRepository::new(pool.clone());

    let job = repo
        .create(&submission("stale", JobPriority::Background))
        .await
        .unwrap();
    repo.claim("exec-a").await.unwrap().unwrap();

    // 新鲜心跳不会被扫出
    assert!(repo.find_stale(Duration::seconds(15)).await.unwrap().is_empty());

    // 把心跳改成过去
    sqlx::query("UPDATE jobs SET last_heartbeat = now() - interval '60 seconds' WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await
        .unwrap();

    let stale = repo.find_stale(Duration::seconds(15)).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, job.id);

    assert!(repo.reset_stale(job.id).await.unwrap());
    let reset = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(reset.status, JobStatus::Pending);
    assert!(reset.executor_id.is_none());
    assert!(reset.started_at.is_none());
    assert!(reset.last_heartbeat.is_none());

    // 已重置的行再次重置为无操作
    assert!(!repo.reset_stale(job.id).await.unwrap());
}

#[tokio::test]
async fn test_retry_promotion_is_conditioned() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    let repo = PostgresJobRepository::new(pool);

    let mut sub = submission("retry", JobPriority::Background);
    sub.max_retries = 1;
    let job = repo.create(&sub).await.unwrap();

    repo.claim("exec-a").await.unwrap().unwrap();
    let fail_req = FailRequest {
        executor_id: "exec-a".to_string(),
        error_message: "boom".to_string(),
        stdout: None,
        stderr: None,
        exit_code: Some(1),
    };
    repo.fail(job.id, &fail_req).await.unwrap();

    let retriable = repo.find_retriable(10).await.unwrap();
    assert_eq!(retriable.len(), 1);

    let retry_after = chrono::Utc::now() + Duration::seconds(60);
    assert!(repo.promote_retry(job.id, retry_after).await.unwrap());

    let promoted = repo.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(promoted.status, JobStatus::Pending);
    assert_eq!(promoted.retry_count, 1);
    assert!(promoted.stdout.is_none());
    assert!(promoted.error_message.is_none());
    assert!(promoted.completed_at.is_none());

    // 重复提升被条件拒绝
    assert!(!repo.promote_retry(job.id, retry_after).await.unwrap());

    // 第二次失败后 retry_count 达到 max_retries，不再可重试
    repo.claim("exec-a").await.unwrap().unwrap();
    repo.fail(job.id, &fail_req).await.unwrap();
    assert!(repo.find_retriable(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retention_cleanup_cascades_attempts() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    let repo = PostgresJobRepository::new(pool.clone());
    let attempts = PostgresJobAttemptRepository::new(pool.clone());

    let job = repo
        .create(&submission("retention", JobPriority::Background))
        .await
        .unwrap();
    repo.claim("exec-a").await.unwrap().unwrap();
    attempts.record(job.id, "exec-a", "10.0.0.1").await.unwrap();
    let req = CompleteRequest {
        executor_id: "exec-a".to_string(),
        stdout: String::new(),
        stderr: String::new(),
        exit_code: 0,
    };
    repo.complete(job.id, &req).await.unwrap();
    attempts
        .close(job.id, AttemptStatus::Completed, None)
        .await
        .unwrap();

    // 完成时间在保留期内，不删除
    assert_eq!(
        repo.delete_terminal_older_than(Duration::hours(48)).await.unwrap(),
        0
    );

    sqlx::query("UPDATE jobs SET completed_at = now() - interval '72 hours' WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(
        repo.delete_terminal_older_than(Duration::hours(48)).await.unwrap(),
        1
    );
    assert!(repo.get_by_id(job.id).await.unwrap().is_none());
    assert!(attempts.list_for_job(job.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_attempt_lifecycle() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    let repo = PostgresJobRepository::new(pool.clone());
    let attempts = PostgresJobAttemptRepository::new(pool);

    let job = repo
        .create(&submission("attempts", JobPriority::Background))
        .await
        .unwrap();

    let attempt = attempts.record(job.id, "exec-a", "10.0.0.1").await.unwrap();
    assert_eq!(attempt.status, AttemptStatus::Running);
    assert!(attempt.ended_at.is_none());

    attempts
        .close(job.id, AttemptStatus::Timeout, Some("心跳超时"))
        .await
        .unwrap();

    let listed = attempts.list_for_job(job.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, AttemptStatus::Timeout);
    assert!(listed[0].ended_at.is_some());
    assert_eq!(listed[0].error_message.as_deref(), Some("心跳超时"));
}

#[tokio::test]
async fn test_list_filters_and_clamp() {
    let Some((pool, _guard)) = test_pool().await else {
        return;
    };
    let repo = PostgresJobRepository::new(pool);

    for _ in 0..3 {
        repo.create(&submission("list-a", JobPriority::Background))
            .await
            .unwrap();
    }
    repo.create(&submission("list-b", JobPriority::Foreground))
        .await
        .unwrap();

    let all = repo.list(&JobFilter::default()).await.unwrap();
    assert_eq!(all.len(), 4);
    // 从新到旧
    assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));

    let filtered = repo
        .list(&JobFilter {
            job_type: Some("list-a".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(filtered.len(), 3);

    let by_priority = repo
        .list(&JobFilter {
            priority: Some(JobPriority::Foreground),
            status: Some(JobStatus::Pending),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_priority.len(), 1);

    let limited = repo
        .list(&JobFilter {
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);
}
