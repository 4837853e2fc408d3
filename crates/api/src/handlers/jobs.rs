use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use executr_domain::{
    entities::{
        AttemptStatus, ClaimRequest, CompleteRequest, FailRequest, HeartbeatRequest, JobDetail,
        JobFilter, JobPriority, JobStatus, JobSubmission,
    },
    repositories::TransitionOutcome,
};

use crate::{
    error::{ApiError, ApiResult},
    routes::AppState,
    validation::validate_submission,
};

/// 作业查询参数
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub priority: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// 批量提交的单项结果
#[derive(Debug, Serialize)]
pub struct BulkItemResult {
    pub index: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 批量取消请求
#[derive(Debug, Deserialize)]
pub struct BulkCancelRequest {
    #[serde(default)]
    pub job_ids: Vec<String>,
}

fn invalid_body(rejection: JsonRejection) -> ApiError {
    ApiError::bad_request(format!("Invalid request body: {rejection}"))
}

/// 提交作业
pub async fn submit_job(
    State(state): State<AppState>,
    body: Result<Json<JobSubmission>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(submission) = body.map_err(invalid_body)?;
    validate_submission(&submission)?;

    let job = state.job_repo.create(&submission).await?;

    metrics::counter!(
        "executr_jobs_submitted_total",
        "type" => job.job_type.clone(),
        "priority" => job.priority.as_str(),
    )
    .increment(1);

    Ok((StatusCode::CREATED, Json(job)))
}

/// 查询作业列表
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            JobStatus::parse(s).ok_or_else(|| ApiError::bad_request(format!("Invalid status: {s}")))
        })
        .transpose()?;
    let priority = query
        .priority
        .as_deref()
        .map(|p| {
            JobPriority::parse(p)
                .ok_or_else(|| ApiError::bad_request(format!("Invalid priority: {p}")))
        })
        .transpose()?;

    let filter = JobFilter {
        status,
        job_type: query.job_type,
        priority,
        limit: query.limit,
        offset: query.offset,
    };

    let jobs = state.job_repo.list(&filter).await?;
    Ok(Json(jobs))
}

/// 查询单个作业（含执行尝试）
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let job = state
        .job_repo
        .get_by_id(id)
        .await?
        .ok_or_else(|| ApiError::not_found_with("Job not found", json!({ "job_id": id })))?;

    // 尝试记录查询失败不影响作业本体返回
    let attempts = match state.attempt_repo.list_for_job(id).await {
        Ok(attempts) => attempts,
        Err(e) => {
            warn!("查询作业 {} 的执行尝试失败: {}", id, e);
            Vec::new()
        }
    };

    Ok(Json(JobDetail { job, attempts }))
}

/// 取消 pending 作业
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    match state.job_repo.cancel(id).await? {
        TransitionOutcome::Applied => {
            metrics::counter!("executr_jobs_cancelled_total").increment(1);
            Ok(StatusCode::NO_CONTENT)
        }
        TransitionOutcome::NotFound => Err(ApiError::not_found_with(
            "Job not found",
            json!({ "job_id": id }),
        )),
        TransitionOutcome::InvalidState => Err(ApiError::InvalidTransition(
            "Only pending jobs can be cancelled".to_string(),
        )),
    }
}

/// 认领作业：原子地把最高优先级、最早创建的 pending 行置为 running
pub async fn claim_job(
    State(state): State<AppState>,
    body: Result<Json<ClaimRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(claim) = body.map_err(invalid_body)?;
    if claim.executor_id.is_empty() || claim.executor_ip.is_empty() {
        return Err(ApiError::bad_request(
            "executor_id and executor_ip are required",
        ));
    }

    let job = match state.job_repo.claim(&claim.executor_id).await? {
        Some(job) => job,
        None => return Ok(StatusCode::NO_CONTENT.into_response()),
    };

    // 尝试记录失败只记日志，不回滚认领
    if let Err(e) = state
        .attempt_repo
        .record(job.id, &claim.executor_id, &claim.executor_ip)
        .await
    {
        warn!("记录作业 {} 的执行尝试失败: {}", job.id, e);
    }

    metrics::counter!(
        "executr_jobs_claimed_total",
        "priority" => job.priority.as_str(),
    )
    .increment(1);

    Ok((StatusCode::OK, Json(job)).into_response())
}

/// 刷新运行中作业的心跳
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body.map_err(invalid_body)?;
    if req.executor_id.is_empty() {
        return Err(ApiError::bad_request("executor_id is required"));
    }

    if state.job_repo.get_by_id(id).await?.is_none() {
        return Err(ApiError::not_found_with(
            "Job not found",
            json!({ "job_id": id }),
        ));
    }

    // 状态或属主不匹配时为静默无操作
    state.job_repo.heartbeat(id, &req.executor_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 上报作业完成
pub async fn complete_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Result<Json<CompleteRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body.map_err(invalid_body)?;
    if req.executor_id.is_empty() {
        return Err(ApiError::bad_request("executor_id is required"));
    }

    match state.job_repo.complete(id, &req).await? {
        TransitionOutcome::Applied => {
            if let Err(e) = state
                .attempt_repo
                .close(id, AttemptStatus::Completed, None)
                .await
            {
                warn!("关闭作业 {} 的执行尝试失败: {}", id, e);
            }
            metrics::counter!("executr_jobs_completed_total").increment(1);
            Ok(StatusCode::NO_CONTENT)
        }
        TransitionOutcome::NotFound => Err(ApiError::not_found_with(
            "Job not found",
            json!({ "job_id": id }),
        )),
        TransitionOutcome::InvalidState => Err(ApiError::InvalidTransition(
            "Job is not running".to_string(),
        )),
    }
}

/// 上报作业失败
pub async fn fail_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Result<Json<FailRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body.map_err(invalid_body)?;
    if req.executor_id.is_empty() || req.error_message.is_empty() {
        return Err(ApiError::bad_request(
            "executor_id and error_message are required",
        ));
    }

    match state.job_repo.fail(id, &req).await? {
        TransitionOutcome::Applied => {
            if let Err(e) = state
                .attempt_repo
                .close(id, AttemptStatus::Failed, Some(&req.error_message))
                .await
            {
                warn!("关闭作业 {} 的执行尝试失败: {}", id, e);
            }
            metrics::counter!("executr_jobs_failed_total").increment(1);
            Ok(StatusCode::NO_CONTENT)
        }
        TransitionOutcome::NotFound => Err(ApiError::not_found_with(
            "Job not found",
            json!({ "job_id": id }),
        )),
        TransitionOutcome::InvalidState => Err(ApiError::InvalidTransition(
            "Job is not running".to_string(),
        )),
    }
}

/// 批量提交（最多 100 条），逐项校验与插入
pub async fn bulk_submit(
    State(state): State<AppState>,
    body: Result<Json<Vec<JobSubmission>>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(submissions) = body.map_err(invalid_body)?;

    if submissions.is_empty() {
        return Err(ApiError::bad_request("No jobs provided"));
    }
    if submissions.len() > 100 {
        return Err(ApiError::bad_request("Too many jobs (max 100)"));
    }

    let mut results = Vec::with_capacity(submissions.len());
    let mut successful = 0usize;

    for (index, submission) in submissions.iter().enumerate() {
        if let Err(e) = validate_submission(submission) {
            results.push(BulkItemResult {
                index,
                success: false,
                job_id: None,
                error: Some(e.to_string()),
            });
            continue;
        }

        match state.job_repo.create(submission).await {
            Ok(job) => {
                successful += 1;
                metrics::counter!(
                    "executr_jobs_submitted_total",
                    "type" => job.job_type.clone(),
                    "priority" => job.priority.as_str(),
                )
                .increment(1);
                results.push(BulkItemResult {
                    index,
                    success: true,
                    job_id: Some(job.id),
                    error: None,
                });
            }
            Err(e) => results.push(BulkItemResult {
                index,
                success: false,
                job_id: None,
                error: Some(e.to_string()),
            }),
        }
    }

    let status = if successful == 0 {
        StatusCode::BAD_REQUEST
    } else if successful < submissions.len() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::CREATED
    };

    let body = json!({
        "total": submissions.len(),
        "successful": successful,
        "failed": submissions.len() - successful,
        "results": results,
    });

    Ok((status, Json(body)).into_response())
}

/// 批量取消：逐项尝试，非 pending 或不存在计入 failed
pub async fn bulk_cancel(
    State(state): State<AppState>,
    body: Result<Json<BulkCancelRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = body.map_err(invalid_body)?;

    if request.job_ids.is_empty() {
        return Err(ApiError::bad_request("Must provide job_ids"));
    }

    let mut cancelled = 0usize;
    let mut failed = 0usize;

    for id_str in &request.job_ids {
        let Ok(id) = Uuid::parse_str(id_str) else {
            failed += 1;
            continue;
        };

        match state.job_repo.cancel(id).await {
            Ok(TransitionOutcome::Applied) => {
                cancelled += 1;
                metrics::counter!("executr_jobs_cancelled_total").increment(1);
            }
            Ok(_) => failed += 1,
            Err(e) => {
                warn!("批量取消作业 {} 失败: {}", id, e);
                failed += 1;
            }
        }
    }

    Ok(Json(json!({
        "cancelled": cancelled,
        "failed": failed,
        "total": cancelled + failed,
    })))
}
