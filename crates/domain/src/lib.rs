//! Executr 领域模型
//!
//! 定义作业、执行尝试等核心实体以及数据访问抽象接口。
//! 实体不依赖具体存储实现，仓储接口由 infrastructure 层实现。

pub mod entities;
pub mod repositories;

pub use entities::{
    AttemptStatus, ClaimRequest, CompleteRequest, FailRequest, HeartbeatRequest, Job, JobAttempt,
    JobDetail, JobFilter, JobPriority, JobResult, JobStatus, JobSubmission,
};
pub use repositories::{
    ExecutorSnapshot, JobAttemptRepository, JobRepository, PriorityCount, StatusCount,
    TransitionOutcome,
};
