//! 错误分类与终止原因
//!
//! 与 RecoveryEngine 配合：网关错误先经 RecoveryEngine 决定重试或终止；
//! 终止时统一落为 Failure（kind + 可读原因），写入 Job / Batch 状态字段，不以异常形式跨越 Job 边界。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::StoreError;

/// 终止类失败的分类（工具级失败只记录在 ToolCallRecord 中，不会出现在这里）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 推理网关过载 / 超时，重试次数耗尽
    TransientUpstream,
    /// 批量响应中缺少该作业的结果，作业自身重试预算耗尽
    UpstreamOmitted,
    /// 网关返回不可重试的错误（格式错误、4xx 等）
    UpstreamRejected,
    /// 超过最大轮数仍未给出终局答案；不会自动重试，需要显式 resume
    RoundBudgetExhausted,
    /// 模型停止调用工具却未给出答案，强制终局轮也未产出答案
    MissingFinalAnswer,
    /// 轮次存储读写失败
    Storage,
    /// 在轮次边界处响应了取消
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::TransientUpstream => "TransientUpstream",
            FailureKind::UpstreamOmitted => "UpstreamOmitted",
            FailureKind::UpstreamRejected => "UpstreamRejected",
            FailureKind::RoundBudgetExhausted => "RoundBudgetExhausted",
            FailureKind::MissingFinalAnswer => "MissingFinalAnswer",
            FailureKind::Storage => "Storage",
            FailureKind::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// 作业终止原因：分类 + 人类可读描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
}

impl Failure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

impl From<StoreError> for Failure {
    fn from(e: StoreError) -> Self {
        Failure::new(FailureKind::Storage, e.to_string())
    }
}

/// 控制面 API 的调用错误（未知作业、拒绝续跑等），只在调用方与控制器之间传递
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Unknown batch: {0}")]
    UnknownBatch(String),

    #[error("Resume refused for session {session_id}: {reason}")]
    ResumeRefused { session_id: String, reason: String },

    #[error("Session {session_id} is owned by {owner}")]
    SessionBusy { session_id: String, owner: String },

    #[error("Empty batch")]
    EmptyBatch,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// 重试决策
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待给定时长后重试同一轮
    RetryAfter(std::time::Duration),
    /// 放弃本轮，作业以该原因终止
    Fail(Failure),
}
