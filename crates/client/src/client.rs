use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use executr_domain::entities::{
    ClaimRequest, CompleteRequest, FailRequest, HeartbeatRequest, Job, JobDetail, JobSubmission,
};
use executr_errors::{ExecutrError, ExecutrResult};

/// 作业列表过滤器
#[derive(Debug, Clone, Default)]
pub struct ListJobsFilter {
    pub status: Option<String>,
    pub job_type: Option<String>,
    pub priority: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// 服务端健康状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
}

/// 服务端错误信封
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    context: Option<serde_json::Value>,
}

/// 协调器 HTTP 客户端
pub struct ExecutrClient {
    base_url: String,
    http: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
    max_retry_delay: Duration,
}

impl ExecutrClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(10),
        }
    }

    /// 自定义重试次数与超时
    pub fn with_options(base_url: &str, max_retries: u32, timeout: Duration) -> Self {
        let mut client = Self::new(base_url);
        client.max_retries = max_retries;
        client.http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 发送一次，不重试（变更型操作）
    async fn execute_once(
        &self,
        request: reqwest::RequestBuilder,
    ) -> ExecutrResult<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| ExecutrError::Network(e.to_string()))
    }

    /// 带指数退避的重试发送（幂等操作）。
    /// 传输错误、5xx 与 429 触发重试，其余响应原样返回。
    async fn execute_retrying(
        &self,
        request: reqwest::RequestBuilder,
    ) -> ExecutrResult<reqwest::Response> {
        let mut delay = self.retry_delay;
        let mut last_err: Option<ExecutrError> = None;

        for attempt in 0..=self.max_retries {
            let cloned = request
                .try_clone()
                .ok_or_else(|| ExecutrError::Internal("请求体不可克隆，无法重试".to_string()))?;

            match cloned.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if !(status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS) {
                        return Ok(resp);
                    }
                    last_err = Some(Self::error_from_response(resp).await);
                }
                Err(e) => {
                    last_err = Some(ExecutrError::Network(e.to_string()));
                }
            }

            if attempt < self.max_retries {
                debug!(
                    "请求失败准备重试 ({}/{}): {:?}",
                    attempt + 1,
                    self.max_retries,
                    last_err
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.max_retry_delay);
            }
        }

        Err(last_err
            .unwrap_or_else(|| ExecutrError::Network("request failed".to_string())))
    }

    /// 把非预期响应解析为带信封的错误
    async fn error_from_response(resp: reqwest::Response) -> ExecutrError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();

        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(envelope) => ExecutrError::Api {
                status,
                message: envelope.error,
                context: envelope.context,
            },
            Err(_) => ExecutrError::Api {
                status,
                message: body,
                context: None,
            },
        }
    }

    async fn expect_status(
        resp: reqwest::Response,
        expected: StatusCode,
    ) -> ExecutrResult<reqwest::Response> {
        if resp.status() == expected {
            Ok(resp)
        } else {
            Err(Self::error_from_response(resp).await)
        }
    }

    /// 提交作业
    pub async fn submit_job(&self, submission: &JobSubmission) -> ExecutrResult<Job> {
        let resp = self
            .execute_once(self.http.post(self.url("/api/v1/jobs")).json(submission))
            .await?;
        let resp = Self::expect_status(resp, StatusCode::CREATED).await?;
        Ok(resp
            .json()
            .await
            .map_err(|e| ExecutrError::Serialization(e.to_string()))?)
    }

    /// 查询作业（含执行尝试）
    pub async fn get_job(&self, job_id: Uuid) -> ExecutrResult<JobDetail> {
        let resp = self
            .execute_retrying(self.http.get(self.url(&format!("/api/v1/jobs/{job_id}"))))
            .await?;
        let resp = Self::expect_status(resp, StatusCode::OK).await?;
        Ok(resp
            .json()
            .await
            .map_err(|e| ExecutrError::Serialization(e.to_string()))?)
    }

    /// 查询作业列表
    pub async fn list_jobs(&self, filter: &ListJobsFilter) -> ExecutrResult<Vec<Job>> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(status) = &filter.status {
            query.push(("status", status.clone()));
        }
        if let Some(job_type) = &filter.job_type {
            query.push(("type", job_type.clone()));
        }
        if let Some(priority) = &filter.priority {
            query.push(("priority", priority.clone()));
        }
        if let Some(limit) = filter.limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(offset) = filter.offset {
            query.push(("offset", offset.to_string()));
        }

        let resp = self
            .execute_retrying(self.http.get(self.url("/api/v1/jobs")).query(&query))
            .await?;
        let resp = Self::expect_status(resp, StatusCode::OK).await?;
        Ok(resp
            .json()
            .await
            .map_err(|e| ExecutrError::Serialization(e.to_string()))?)
    }

    /// 取消 pending 作业
    pub async fn cancel_job(&self, job_id: Uuid) -> ExecutrResult<()> {
        let resp = self
            .execute_once(self.http.delete(self.url(&format!("/api/v1/jobs/{job_id}"))))
            .await?;
        Self::expect_status(resp, StatusCode::NO_CONTENT).await?;
        Ok(())
    }

    /// 认领下一个作业；队列为空返回 None
    pub async fn claim_next_job(
        &self,
        executor_id: &str,
        executor_ip: &str,
    ) -> ExecutrResult<Option<Job>> {
        let claim = ClaimRequest {
            executor_id: executor_id.to_string(),
            executor_ip: executor_ip.to_string(),
        };

        let resp = self
            .execute_once(self.http.post(self.url("/api/v1/jobs/claim")).json(&claim))
            .await?;

        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let resp = Self::expect_status(resp, StatusCode::OK).await?;
        let job = resp
            .json()
            .await
            .map_err(|e| ExecutrError::Serialization(e.to_string()))?;
        Ok(Some(job))
    }

    /// 上报运行中作业的心跳（幂等，自动重试）
    pub async fn heartbeat(&self, job_id: Uuid, executor_id: &str) -> ExecutrResult<()> {
        let req = HeartbeatRequest {
            executor_id: executor_id.to_string(),
        };
        let resp = self
            .execute_retrying(
                self.http
                    .put(self.url(&format!("/api/v1/jobs/{job_id}/heartbeat")))
                    .json(&req),
            )
            .await?;
        Self::expect_status(resp, StatusCode::NO_CONTENT).await?;
        Ok(())
    }

    /// 上报作业完成
    pub async fn complete_job(&self, job_id: Uuid, req: &CompleteRequest) -> ExecutrResult<()> {
        let resp = self
            .execute_once(
                self.http
                    .put(self.url(&format!("/api/v1/jobs/{job_id}/complete")))
                    .json(req),
            )
            .await?;
        Self::expect_status(resp, StatusCode::NO_CONTENT).await?;
        Ok(())
    }

    /// 上报作业失败
    pub async fn fail_job(&self, job_id: Uuid, req: &FailRequest) -> ExecutrResult<()> {
        let resp = self
            .execute_once(
                self.http
                    .put(self.url(&format!("/api/v1/jobs/{job_id}/fail")))
                    .json(req),
            )
            .await?;
        Self::expect_status(resp, StatusCode::NO_CONTENT).await?;
        Ok(())
    }

    /// 服务端健康检查（幂等，自动重试）
    pub async fn health(&self) -> ExecutrResult<HealthResponse> {
        let resp = self
            .execute_retrying(self.http.get(self.url("/api/v1/health")))
            .await?;
        let resp = Self::expect_status(resp, StatusCode::OK).await?;
        Ok(resp
            .json()
            .await
            .map_err(|e| ExecutrError::Serialization(e.to_string()))?)
    }
}
