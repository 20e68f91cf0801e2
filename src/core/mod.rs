//! 核心：失败分类、控制面错误、重试与退避策略、运行时装配

pub mod builder;
pub mod error;
pub mod recovery;

pub use builder::{Runtime, RuntimeBuilder};
pub use error::{ControlError, Failure, FailureKind, RecoveryAction};
pub use recovery::{BackoffPolicy, RecoveryEngine};
