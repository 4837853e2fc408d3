//! Executr 协调器后台循环
//!
//! 三个单线程定时循环：过期作业恢复、保留期清理、重试提升。
//! 每个循环在 tick 内跑完一轮后睡到下一个 tick，单行失败只记日志。

pub mod cleanup_service;
pub mod recovery_service;
pub mod retry_service;

pub use cleanup_service::{CleanupConfig, CleanupService};
pub use recovery_service::{RecoveryConfig, RecoveryService};
pub use retry_service::{RetryConfig, RetryService};
