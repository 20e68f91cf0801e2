//! 作业数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::Failure;

/// 作业 ID
pub type JobId = String;

/// 作业状态：PENDING → RUNNING → {SUCCEEDED, FAILED, CANCELLED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// 等待执行
    Pending,
    /// 正在执行
    Running,
    /// 已给出终局答案
    Succeeded,
    /// 执行失败
    Failed,
    /// 已取消
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// 作业记录：绑定一个会话的一次执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub session_id: String,
    pub status: JobStatus,
    /// 本作业的第一轮序号（续跑时为 last + 1）
    pub first_round: u32,
    /// 本作业已完成并持久化的轮数
    pub rounds_run: u32,
    /// 终局答案
    pub result: Option<Value>,
    /// 终止原因
    pub error: Option<Failure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(session_id: impl Into<String>, first_round: u32) -> Self {
        let now = Utc::now();
        Self {
            id: format!("job_{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            status: JobStatus::Pending,
            first_round,
            rounds_run: 0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// PENDING → RUNNING；其他状态不变
    pub fn mark_running(&mut self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.updated_at = now;
        true
    }

    /// 记录最新完成的轮次
    pub fn record_round(&mut self, round_index: u32) {
        if self.is_finished() {
            return;
        }
        self.rounds_run = round_index.saturating_add(1).saturating_sub(self.first_round);
        self.updated_at = Utc::now();
    }

    /// 进入终态；终态一经写入不再改变，重复调用返回 false
    pub fn finish(&mut self, status: JobStatus, result: Option<Value>, error: Option<Failure>) -> bool {
        if self.is_finished() || !status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.status = status;
        self.result = result;
        self.error = error;
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }
}
