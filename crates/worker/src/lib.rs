//! Executr 执行器运行时
//!
//! 认领循环、按内容寻址的二进制缓存与作业运行器。
//! 并发由容量为 max_jobs 的信号量约束，每个在途作业有独立的
//! 心跳泵与工作目录。

pub mod cache;
pub mod runner;
pub mod service;

pub use cache::BinaryCache;
pub use runner::JobRunner;
pub use service::{WorkerConfig, WorkerService};
