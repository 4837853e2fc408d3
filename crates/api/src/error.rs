use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use executr_errors::ExecutrError;
use serde_json::{json, Value};

/// API 错误类型
///
/// 统一渲染为 `{"error": "...", "context": {...}}` 信封，
/// context 仅在有附加信息时出现。
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{message}")]
    NotFound {
        message: String,
        context: Option<Value>,
    },

    #[error("{0}")]
    InvalidTransition(String),

    #[error("内部服务器错误")]
    Internal(#[source] ExecutrError),
}

impl ApiError {
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound {
            message: msg.into(),
            context: None,
        }
    }

    pub fn not_found_with<S: Into<String>>(msg: S, context: Value) -> Self {
        Self::NotFound {
            message: msg.into(),
            context: Some(context),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::InvalidTransition(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ExecutrError> for ApiError {
    fn from(err: ExecutrError) -> Self {
        match err {
            ExecutrError::ValidationError(msg) => ApiError::BadRequest(msg),
            ExecutrError::JobNotFound { id } => ApiError::not_found(format!("Job not found: {id}")),
            ExecutrError::InvalidTransition(msg) => ApiError::InvalidTransition(msg),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, context) = match self {
            // 内部错误细节不下发给客户端，只落日志
            ApiError::Internal(source) => {
                tracing::error!("请求处理失败: {}", source);
                ("Internal server error".to_string(), None)
            }
            ApiError::NotFound { message, context } => (message, context),
            other => (other.to_string(), None),
        };

        let mut body = json!({ "error": message });
        if let Some(context) = context {
            body["context"] = context;
        }
        (status, Json(body)).into_response()
    }
}

/// API 结果类型
pub type ApiResult<T> = Result<T, ApiError>;
