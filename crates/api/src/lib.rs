//! Executr 协调器 HTTP API
//!
//! 基于 axum 的作业接口：提交/查询/取消/认领/心跳/完成/失败，
//! 以及批量操作、管理与健康检查端点。所有路由挂载在 /api/v1 下。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod validation;

pub use error::{ApiError, ApiResult};
pub use routes::{create_routes, AppState};
