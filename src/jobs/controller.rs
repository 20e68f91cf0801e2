//! 单作业控制器
//!
//! 核心功能：
//! - submit：新建会话与作业（PENDING），后台执行（并发数受 jobs.max_concurrent 限制）
//! - run：循环调用 RoundExecutor::advance，直到 Done / Failed，或在轮次边界观察到取消
//! - cancel：只设置协作式取消标记并立即返回；正在进行的一轮会先完整持久化
//! - resume：为已有会话创建新作业，编号从 last + 1 继续；会话被其他作业或批次占用时拒绝
//! - prune_finished：清理已结束作业的槽位
//! - status / wait / rounds：状态查询

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::{ControlError, Failure, FailureKind};
use crate::history::{ArtifactRef, Round, StoreError};
use crate::jobs::{JobId, JobRecord, JobStatus};
use crate::rounds::{RoundExecutor, RoundOutcome, RunWindow, SessionLease};

struct JobSlot {
    record: JobRecord,
    cancel: CancellationToken,
    status_tx: watch::Sender<JobStatus>,
}

pub struct JobController {
    executor: Arc<RoundExecutor>,
    jobs: RwLock<HashMap<JobId, JobSlot>>,
    permits: Arc<Semaphore>,
}

impl JobController {
    pub fn new(executor: Arc<RoundExecutor>, max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            executor,
            jobs: RwLock::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        })
    }

    pub fn executor(&self) -> &Arc<RoundExecutor> {
        &self.executor
    }

    /// 提交新文献：创建会话与作业，后台执行
    pub async fn submit(self: &Arc<Self>, artifact: ArtifactRef) -> Result<JobId, ControlError> {
        let meta = self.executor.create_session(artifact).await?;
        let record = JobRecord::new(&meta.id, 1);
        let job_id = record.id.clone();
        let lease = self
            .executor
            .leases()
            .acquire(&meta.id, &job_id)
            .map_err(|owner| ControlError::SessionBusy {
                session_id: meta.id.clone(),
                owner,
            })?;
        let cancel = self.insert(record).await;
        self.spawn(job_id.clone(), RunWindow::new(&meta.id, 1), None, cancel, lease);
        Ok(job_id)
    }

    /// 续跑已有会话：未知会话、已有终局轮、会话仍被作业或批次占用时拒绝
    pub async fn resume(
        self: &Arc<Self>,
        session_id: &str,
        new_artifact: Option<ArtifactRef>,
    ) -> Result<JobId, ControlError> {
        let refused = |reason: String| ControlError::ResumeRefused {
            session_id: session_id.to_string(),
            reason,
        };

        let mut record = JobRecord::new(session_id, 0);
        let job_id = record.id.clone();
        // 先占用会话，之后的检查与窗口计算不会与其他写者交错
        let lease = self
            .executor
            .leases()
            .acquire(session_id, &job_id)
            .map_err(|owner| refused(format!("session is still owned by {owner}")))?;

        let rounds = match self.executor.store().load(session_id).await {
            Ok(rounds) => rounds,
            Err(StoreError::NotFound(_)) | Err(StoreError::InvalidId(_)) => {
                return Err(refused("unknown session".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if rounds.last().map(|r| r.is_final).unwrap_or(false) {
            return Err(refused("session already has a final answer".to_string()));
        }
        let first_round = rounds.last().map(|r| r.round_index).unwrap_or(0) + 1;
        record.first_round = first_round;
        let cancel = self.insert(record).await;

        tracing::info!(job_id = %job_id, session_id = %session_id, first_round, "resuming session");
        self.spawn(
            job_id.clone(),
            RunWindow::new(session_id, first_round),
            new_artifact,
            cancel,
            lease,
        );
        Ok(job_id)
    }

    /// 请求取消：返回 true 表示标记已设置；作业已结束时返回 false
    pub async fn cancel(&self, job_id: &str) -> Result<bool, ControlError> {
        let jobs = self.jobs.read().await;
        let slot = jobs
            .get(job_id)
            .ok_or_else(|| ControlError::UnknownJob(job_id.to_string()))?;
        if slot.record.is_finished() {
            return Ok(false);
        }
        slot.cancel.cancel();
        tracing::info!(job_id = %job_id, "cancellation requested");
        Ok(true)
    }

    pub async fn status(&self, job_id: &str) -> Result<JobRecord, ControlError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .map(|slot| slot.record.clone())
            .ok_or_else(|| ControlError::UnknownJob(job_id.to_string()))
    }

    pub async fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .jobs
            .read()
            .await
            .values()
            .map(|slot| slot.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// 等待作业进入终态
    pub async fn wait(&self, job_id: &str) -> Result<JobRecord, ControlError> {
        let mut rx = {
            let jobs = self.jobs.read().await;
            let slot = jobs
                .get(job_id)
                .ok_or_else(|| ControlError::UnknownJob(job_id.to_string()))?;
            slot.status_tx.subscribe()
        };
        // 发送端随作业槽位一直存在，wait_for 只会在终态时返回
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        self.status(job_id).await
    }

    /// 移除已结束作业的槽位，返回移除数量；之后对这些 job_id 的查询返回 UnknownJob
    pub async fn prune_finished(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, slot| !slot.record.is_finished());
        before - jobs.len()
    }

    /// 会话已持久化的轮次（可在作业运行中观察）
    pub async fn rounds(&self, session_id: &str) -> Result<Vec<Round>, ControlError> {
        Ok(self.executor.store().load(session_id).await?)
    }

    async fn insert(&self, record: JobRecord) -> CancellationToken {
        let cancel = CancellationToken::new();
        let (status_tx, _) = watch::channel(JobStatus::Pending);
        self.jobs.write().await.insert(
            record.id.clone(),
            JobSlot {
                record,
                cancel: cancel.clone(),
                status_tx,
            },
        );
        cancel
    }

    fn spawn(
        self: &Arc<Self>,
        job_id: JobId,
        window: RunWindow,
        new_input: Option<ArtifactRef>,
        cancel: CancellationToken,
        lease: SessionLease,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(job_id, window, new_input, cancel, lease).await;
        });
    }

    async fn run(
        &self,
        job_id: JobId,
        window: RunWindow,
        new_input: Option<ArtifactRef>,
        cancel: CancellationToken,
        lease: SessionLease,
    ) {
        let _permit = self.permits.clone().acquire_owned().await.ok();

        if !self.update(&job_id, |r| r.mark_running()).await {
            return;
        }
        tracing::info!(job_id = %job_id, session_id = %window.session_id, "job started");

        let (status, result, error) = self.drive(&job_id, &window, new_input, &cancel).await;
        // 先释放租约再公布终态：wait 返回时会话已可续跑
        drop(lease);
        self.finish(&job_id, status, result, error).await;
    }

    async fn drive(
        &self,
        job_id: &str,
        window: &RunWindow,
        mut new_input: Option<ArtifactRef>,
        cancel: &CancellationToken,
    ) -> (JobStatus, Option<serde_json::Value>, Option<Failure>) {
        loop {
            // 取消只在轮次边界检查
            if cancel.is_cancelled() {
                let failure = Failure::new(
                    FailureKind::Cancelled,
                    "cancelled at round boundary".to_string(),
                );
                return (JobStatus::Cancelled, None, Some(failure));
            }

            match self.executor.advance(window, new_input.take()).await {
                RoundOutcome::Continue { round_index } => {
                    self.update(job_id, |r| {
                        r.record_round(round_index);
                        true
                    })
                    .await;
                }
                RoundOutcome::Done {
                    round_index,
                    answer,
                } => {
                    self.update(job_id, |r| {
                        r.record_round(round_index);
                        true
                    })
                    .await;
                    return (JobStatus::Succeeded, Some(answer), None);
                }
                RoundOutcome::Failed(failure) => {
                    if let Ok(rounds) = self.executor.store().load(&window.session_id).await {
                        if let Some(last) = rounds.last() {
                            if last.round_index >= window.first_round {
                                let idx = last.round_index;
                                self.update(job_id, |r| {
                                    r.record_round(idx);
                                    true
                                })
                                .await;
                            }
                        }
                    }
                    return (JobStatus::Failed, None, Some(failure));
                }
            }
        }
    }

    async fn update(&self, job_id: &str, f: impl FnOnce(&mut JobRecord) -> bool) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(slot) = jobs.get_mut(job_id) else {
            return false;
        };
        let changed = f(&mut slot.record);
        if changed {
            slot.status_tx.send_replace(slot.record.status);
        }
        changed
    }

    async fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<Failure>,
    ) {
        let reason = error.as_ref().map(|f| f.to_string());
        if self
            .update(job_id, |r| r.finish(status, result, error))
            .await
        {
            match status {
                JobStatus::Succeeded => tracing::info!(job_id = %job_id, "job succeeded"),
                _ => tracing::warn!(
                    job_id = %job_id,
                    status = %status,
                    reason = reason.as_deref().unwrap_or(""),
                    "job ended"
                ),
            }
        }
    }
}
