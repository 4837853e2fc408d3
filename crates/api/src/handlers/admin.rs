use axum::{extract::State, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;

use crate::{error::ApiResult, routes::AppState};

/// 系统统计：作业按状态计数、待认领按优先级计数、活跃执行器数量
pub async fn get_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let status_counts = state.job_repo.count_by_status().await?;
    let priority_counts = state.job_repo.count_pending_by_priority().await?;
    let executors = state.job_repo.active_executors().await?;

    // 顺手刷新队列深度指标
    for count in &priority_counts {
        metrics::gauge!(
            "executr_jobs_pending",
            "priority" => count.priority.clone(),
        )
        .set(count.count as f64);
    }
    for count in &status_counts {
        metrics::gauge!(
            "executr_jobs_by_status",
            "status" => count.status.clone(),
        )
        .set(count.count as f64);
    }

    Ok(Json(json!({
        "jobs_by_status": status_counts,
        "pending_by_priority": priority_counts,
        "active_executors": executors.len(),
        "timestamp": Utc::now(),
    })))
}

/// 活跃执行器列表（running 作业行的快照）
pub async fn get_executors(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let executors = state.job_repo.active_executors().await?;
    Ok(Json(executors))
}
