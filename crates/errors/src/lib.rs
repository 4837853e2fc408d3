use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutrError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("作业未找到: {id}")]
    JobNotFound { id: String },
    #[error("无效的状态转换: {0}")]
    InvalidTransition(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("摘要不匹配: 期望 {expected}, 实际 {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("二进制下载失败: {0}")]
    Download(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("服务端错误 (HTTP {status}): {message}")]
    Api {
        status: u16,
        message: String,
        context: Option<serde_json::Value>,
    },
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type ExecutrResult<T> = Result<T, ExecutrError>;

impl ExecutrError {
    pub fn job_not_found(id: impl std::fmt::Display) -> Self {
        Self::JobNotFound { id: id.to_string() }
    }
    pub fn invalid_transition<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTransition(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 判断该错误是否可以安全重试（幂等调用层使用）
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutrError::Network(_)
            | ExecutrError::Database(_)
            | ExecutrError::DatabaseOperation(_) => true,
            ExecutrError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ExecutrError {
    fn from(err: serde_json::Error) -> Self {
        ExecutrError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ExecutrError {
    fn from(err: anyhow::Error) -> Self {
        ExecutrError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExecutrError::Network("connection refused".to_string()).is_retryable());
        assert!(ExecutrError::Api {
            status: 503,
            message: "unavailable".to_string(),
            context: None,
        }
        .is_retryable());
        assert!(ExecutrError::Api {
            status: 429,
            message: "too many requests".to_string(),
            context: None,
        }
        .is_retryable());
        assert!(!ExecutrError::Api {
            status: 404,
            message: "not found".to_string(),
            context: None,
        }
        .is_retryable());
        assert!(!ExecutrError::ValidationError("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_helper_constructors() {
        let err = ExecutrError::job_not_found("123e4567-e89b-12d3-a456-426614174000");
        assert!(matches!(err, ExecutrError::JobNotFound { .. }));

        let err = ExecutrError::invalid_transition("cancel on running job");
        assert!(matches!(err, ExecutrError::InvalidTransition(_)));
    }
}
