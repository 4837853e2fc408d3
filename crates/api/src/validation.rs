//! 提交请求校验

use executr_domain::entities::JobSubmission;

use crate::error::{ApiError, ApiResult};

/// 校验作业提交：type 非空且不含空白字符，binary_url 非空，max_retries 非负。
/// priority 的合法性由枚举反序列化保证。
pub fn validate_submission(submission: &JobSubmission) -> ApiResult<()> {
    if submission.job_type.is_empty() || submission.binary_url.is_empty() {
        return Err(ApiError::bad_request("type and binary_url are required"));
    }
    if submission.job_type.chars().any(char::is_whitespace) {
        return Err(ApiError::bad_request("type must not contain whitespace"));
    }
    if submission.max_retries < 0 {
        return Err(ApiError::bad_request("max_retries must be non-negative"));
    }
    Ok(())
}
