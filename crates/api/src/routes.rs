use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;

use executr_domain::repositories::{JobAttemptRepository, JobRepository};

use crate::handlers::{
    admin::{get_executors, get_stats},
    health::health_check,
    jobs::{
        bulk_cancel, bulk_submit, cancel_job, claim_job, complete_job, fail_job, get_job,
        heartbeat, list_jobs, submit_job,
    },
    metrics::render_metrics,
};

/// API 共享状态
#[derive(Clone)]
pub struct AppState {
    pub job_repo: Arc<dyn JobRepository>,
    pub attempt_repo: Arc<dyn JobAttemptRepository>,
    /// Prometheus 文本渲染句柄；未安装 recorder 时为空（测试环境）
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        job_repo: Arc<dyn JobRepository>,
        attempt_repo: Arc<dyn JobAttemptRepository>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            job_repo,
            attempt_repo,
            metrics,
        }
    }
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/metrics", get(render_metrics))
        .route("/api/v1/jobs", post(submit_job).get(list_jobs))
        .route("/api/v1/jobs/claim", post(claim_job))
        .route("/api/v1/jobs/bulk", post(bulk_submit))
        .route("/api/v1/jobs/bulk/cancel", post(bulk_cancel))
        .route("/api/v1/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/api/v1/jobs/{id}/heartbeat", put(heartbeat))
        .route("/api/v1/jobs/{id}/complete", put(complete_job))
        .route("/api/v1/jobs/{id}/fail", put(fail_job))
        .route("/api/v1/admin/stats", get(get_stats))
        .route("/api/v1/admin/executors", get(get_executors))
        .layer(middleware::from_fn(crate::middleware::request_metrics))
        .layer(crate::middleware::trace_layer())
        .layer(crate::middleware::cors_layer())
        .with_state(state)
}
