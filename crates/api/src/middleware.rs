use axum::{extract::Request, http::Method, middleware::Next, response::Response};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// HTTP 请求指标：按方法与状态码计数并记录时延
pub async fn request_metrics(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let start = std::time::Instant::now();

    let response = next.run(request).await;
    let duration = start.elapsed();

    metrics::counter!(
        "executr_http_requests_total",
        "method" => method.to_string(),
        "status" => response.status().as_u16().to_string(),
    )
    .increment(1);
    metrics::histogram!("executr_http_request_duration_seconds")
        .record(duration.as_secs_f64());

    response
}

pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}

pub fn trace_layer(
) -> TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>>
{
    TraceLayer::new_for_http()
}
