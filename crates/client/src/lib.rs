//! Executr 客户端 SDK
//!
//! 协调器作业 API 的类型化封装，供执行器与命令行前端使用。
//! 幂等的 GET 与心跳在传输层自动重试；变更型操作只发送一次，
//! 服务端的状态条件更新保证手工重试也是安全的。

mod client;

pub use client::{ExecutrClient, HealthResponse, ListJobsFilter};
