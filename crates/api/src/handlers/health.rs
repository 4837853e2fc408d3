use std::time::Duration;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::routes::AppState;

/// 健康检查：带 5 秒超时探测存储连通性
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let db_ok = tokio::time::timeout(Duration::from_secs(5), state.job_repo.count_by_status())
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);

    let (status, database) = if db_ok {
        ("healthy", "connected")
    } else {
        ("unhealthy", "disconnected")
    };

    Json(json!({
        "status": status,
        "database": database,
    }))
}
