use axum::{extract::State, http::header, response::IntoResponse};

use crate::routes::AppState;

/// Prometheus 文本格式指标
pub async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
