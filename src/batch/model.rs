//! 批次视图：聚合计数与成员状态

use serde::Serialize;

use crate::jobs::{JobRecord, JobStatus};

/// 批次 ID
pub type BatchId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Running,
    Completed,
    Cancelled,
}

/// 成员状态计数；单个成员失败不会让整个批次失败
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchCounts {
    pub fn from_members(members: &[MemberView]) -> Self {
        let mut counts = BatchCounts {
            total: members.len(),
            ..Default::default()
        };
        for m in members {
            match m.job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn active(&self) -> usize {
        self.pending + self.running
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberView {
    pub alias: String,
    pub job: JobRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchView {
    pub id: BatchId,
    pub status: BatchStatus,
    pub global_round: u32,
    pub counts: BatchCounts,
    pub members: Vec<MemberView>,
}

impl BatchView {
    pub fn member(&self, alias: &str) -> Option<&MemberView> {
        self.members.iter().find(|m| m.alias == alias)
    }

    pub fn is_finished(&self) -> bool {
        self.status != BatchStatus::Running
    }
}
