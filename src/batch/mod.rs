//! 批量调度：多个作业按全局轮次同步推进，每轮一次合并网关调用

pub mod model;
pub mod scheduler;

pub use model::{BatchCounts, BatchId, BatchStatus, BatchView, MemberView};
pub use scheduler::BatchScheduler;
