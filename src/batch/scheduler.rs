//! 批量调度器
//!
//! 多个会话按全局轮次同步推进，每一轮只向网关提交一次合并批次：
//! 1. 区分活跃成员与已结束成员
//! 2. 对每个活跃成员用 RoundExecutor::prepare 构造请求
//! 3. 合并提交（失败按退避重试），按 poll_interval 轮询，受 poll_timeout 约束
//! 4. 按 alias 拆分结果；缺失的结果记为 UpstreamOmitted，只消耗该成员自己的重试预算
//! 5. 用 RoundExecutor::apply 并发应用各成员的回复，终态成员离开活跃集合
//! 6. 所有成员处理完后 global_round + 1（没有任何回复被应用的轮次不计数）；
//!    有成员处于退避中时，下一次合并提交前等待其中最长的退避时长
//! 7. 无活跃成员或达到 max_global_rounds 时停止；仍活跃的成员记为 FAILED(RoundBudgetExhausted)
//!
//! 批次运行期间持有每个成员会话的写入租约，成员结束时释放；轮询遇到可重试错误时继续轮询同一批次。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchCounts, BatchId, BatchStatus, BatchView, MemberView};
use crate::config::BatchSection;
use crate::core::{ControlError, Failure, FailureKind, RecoveryAction};
use crate::history::ArtifactRef;
use crate::jobs::{JobRecord, JobStatus};
use crate::llm::{BatchItem, BatchPoll, GatewayError, ModelReply};
use crate::rounds::{PreparedRound, RoundExecutor, RoundOutcome, RunWindow, SessionLease};

type Replies = HashMap<String, Result<ModelReply, GatewayError>>;

struct Member {
    alias: String,
    record: JobRecord,
    window: RunWindow,
    /// 当前轮连续失败次数（成功收到回复后清零）
    failures: u32,
    /// 会话写入租约；成员结束后释放
    lease: Option<SessionLease>,
}

impl Member {
    fn view(&self) -> MemberView {
        MemberView {
            alias: self.alias.clone(),
            job: self.record.clone(),
        }
    }

    fn fail(&mut self, failure: Failure) {
        tracing::warn!(alias = %self.alias, failure = %failure, "batch member failed");
        self.record.finish(JobStatus::Failed, None, Some(failure));
    }

    /// 记一次失败；返回需要等待的时长（None 表示成员已终止）
    fn charge(&mut self, action: RecoveryAction) -> Option<Duration> {
        match action {
            RecoveryAction::RetryAfter(delay) => Some(delay),
            RecoveryAction::Fail(failure) => {
                self.fail(failure);
                None
            }
        }
    }
}

struct BatchSlot {
    view: BatchView,
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
}

pub struct BatchScheduler {
    executor: Arc<RoundExecutor>,
    settings: BatchSection,
    batches: RwLock<HashMap<BatchId, BatchSlot>>,
}

impl BatchScheduler {
    pub fn new(executor: Arc<RoundExecutor>, settings: BatchSection) -> Arc<Self> {
        Arc::new(Self {
            executor,
            settings,
            batches: RwLock::new(HashMap::new()),
        })
    }

    /// 为每个文献建会话与作业，后台按全局轮次推进
    pub async fn submit_batch(
        self: &Arc<Self>,
        artifacts: Vec<ArtifactRef>,
    ) -> Result<BatchId, ControlError> {
        if artifacts.is_empty() {
            return Err(ControlError::EmptyBatch);
        }

        let batch_id = format!("batch_{}", uuid::Uuid::new_v4());
        let mut members = Vec::with_capacity(artifacts.len());
        let mut aliases = HashSet::new();
        for artifact in artifacts {
            let label = artifact.label();
            let meta = self.executor.create_session(artifact).await?;
            let lease = self
                .executor
                .leases()
                .acquire(&meta.id, &batch_id)
                .map_err(|owner| ControlError::SessionBusy {
                    session_id: meta.id.clone(),
                    owner,
                })?;
            let short: String = meta.id.chars().take(8).collect();
            let mut alias = format!("{}_{}", label, short);
            if !aliases.insert(alias.clone()) {
                alias = format!("{}_{}", alias, members.len());
                aliases.insert(alias.clone());
            }
            members.push(Member {
                alias,
                record: JobRecord::new(&meta.id, 1),
                window: RunWindow::new(&meta.id, 1),
                failures: 0,
                lease: Some(lease),
            });
        }

        let cancel = CancellationToken::new();
        let (done_tx, _) = watch::channel(false);
        let view = snapshot(&batch_id, 0, BatchStatus::Running, &members);
        self.batches.write().await.insert(
            batch_id.clone(),
            BatchSlot {
                view,
                cancel: cancel.clone(),
                done_tx,
            },
        );
        tracing::info!(batch_id = %batch_id, members = members.len(), "batch submitted");

        let this = Arc::clone(self);
        let id = batch_id.clone();
        tokio::spawn(async move {
            this.drive(id, members, cancel).await;
        });
        Ok(batch_id)
    }

    pub async fn status(&self, batch_id: &str) -> Result<BatchView, ControlError> {
        self.batches
            .read()
            .await
            .get(batch_id)
            .map(|slot| slot.view.clone())
            .ok_or_else(|| ControlError::UnknownBatch(batch_id.to_string()))
    }

    /// 等待批次结束
    pub async fn wait(&self, batch_id: &str) -> Result<BatchView, ControlError> {
        let mut rx = {
            let batches = self.batches.read().await;
            let slot = batches
                .get(batch_id)
                .ok_or_else(|| ControlError::UnknownBatch(batch_id.to_string()))?;
            slot.done_tx.subscribe()
        };
        let _ = rx.wait_for(|done| *done).await;
        self.status(batch_id).await
    }

    /// 请求取消：在全局轮次之间生效，剩余活跃成员记为 CANCELLED
    pub async fn cancel(&self, batch_id: &str) -> Result<bool, ControlError> {
        let batches = self.batches.read().await;
        let slot = batches
            .get(batch_id)
            .ok_or_else(|| ControlError::UnknownBatch(batch_id.to_string()))?;
        if slot.view.is_finished() {
            return Ok(false);
        }
        slot.cancel.cancel();
        tracing::info!(batch_id = %batch_id, "batch cancellation requested");
        Ok(true)
    }

    /// 移除已结束批次的槽位，返回移除数量
    pub async fn prune_finished(&self) -> usize {
        let mut batches = self.batches.write().await;
        let before = batches.len();
        batches.retain(|_, slot| !slot.view.is_finished());
        before - batches.len()
    }

    async fn publish(
        &self,
        batch_id: &str,
        global_round: u32,
        status: BatchStatus,
        members: &mut [Member],
    ) {
        // 终态成员的会话先释放，再对外公布
        for m in members.iter_mut().filter(|m| m.record.is_finished()) {
            m.lease.take();
        }
        let view = snapshot(batch_id, global_round, status, members);
        let mut batches = self.batches.write().await;
        if let Some(slot) = batches.get_mut(batch_id) {
            slot.view = view;
            if status != BatchStatus::Running {
                slot.done_tx.send_replace(true);
            }
        }
    }

    async fn drive(&self, batch_id: BatchId, mut members: Vec<Member>, cancel: CancellationToken) {
        let mut global_round = 0u32;

        let final_status = loop {
            if cancel.is_cancelled() {
                for m in members.iter_mut().filter(|m| !m.record.is_finished()) {
                    m.record.finish(
                        JobStatus::Cancelled,
                        None,
                        Some(Failure::new(FailureKind::Cancelled, "batch cancelled")),
                    );
                }
                break BatchStatus::Cancelled;
            }

            let active: Vec<usize> = (0..members.len())
                .filter(|&i| !members[i].record.is_finished())
                .collect();
            if active.is_empty() {
                break BatchStatus::Completed;
            }
            if global_round >= self.settings.max_global_rounds {
                for &i in &active {
                    members[i].fail(Failure::new(
                        FailureKind::RoundBudgetExhausted,
                        format!("batch stopped after {} global rounds", global_round),
                    ));
                }
                break BatchStatus::Completed;
            }

            tracing::info!(
                batch_id = %batch_id,
                global_round = global_round + 1,
                active = active.len(),
                "batch round started"
            );
            let mut prepared: Vec<(usize, PreparedRound)> = Vec::with_capacity(active.len());
            for &i in &active {
                let member = &mut members[i];
                member.record.mark_running();
                match self.executor.prepare(&member.window, None).await {
                    Ok(p) => prepared.push((i, p)),
                    Err(failure) => member.fail(failure),
                }
            }

            let mut waits: Vec<Duration> = Vec::new();
            let mut applied = 0usize;
            if !prepared.is_empty() {
                let items: Vec<BatchItem> = prepared
                    .iter()
                    .map(|(i, p)| BatchItem {
                        alias: members[*i].alias.clone(),
                        context: p.context.clone(),
                        tools: p.catalog.clone(),
                    })
                    .collect();

                match self.run_remote(&batch_id, items).await {
                    Err(e) => {
                        tracing::warn!(
                            batch_id = %batch_id,
                            error = %e,
                            "batch round failed for all members"
                        );
                        for (i, p) in &prepared {
                            let member = &mut members[*i];
                            member.failures += 1;
                            let action =
                                self.executor
                                    .recovery()
                                    .handle(&e, member.failures, p.max_retries);
                            waits.extend(member.charge(action));
                        }
                    }
                    Ok(mut replies) => {
                        let mut to_apply = Vec::new();
                        for (i, p) in prepared {
                            let member = &mut members[i];
                            match replies.remove(&member.alias) {
                                Some(Ok(reply)) => {
                                    member.failures = 0;
                                    to_apply.push((i, p, reply));
                                }
                                Some(Err(e)) => {
                                    member.failures += 1;
                                    let action = self.executor.recovery().handle(
                                        &e,
                                        member.failures,
                                        p.max_retries,
                                    );
                                    waits.extend(member.charge(action));
                                }
                                None => {
                                    member.failures += 1;
                                    tracing::warn!(
                                        alias = %member.alias,
                                        attempt = member.failures,
                                        "reply missing from batch response"
                                    );
                                    let action = self.executor.recovery().handle_omitted(
                                        &member.alias,
                                        member.failures,
                                        p.max_retries,
                                    );
                                    waits.extend(member.charge(action));
                                }
                            }
                        }

                        applied = to_apply.len();
                        let executor = &self.executor;
                        let outcomes =
                            join_all(to_apply.into_iter().map(|(i, p, reply)| async move {
                                let round_index = p.round_index;
                                (i, round_index, executor.apply(p, reply).await)
                            }))
                            .await;
                        for (i, round_index, outcome) in outcomes {
                            let member = &mut members[i];
                            match outcome {
                                RoundOutcome::Continue { .. } => {
                                    member.record.record_round(round_index)
                                }
                                RoundOutcome::Done { answer, .. } => {
                                    member.record.record_round(round_index);
                                    member.record.finish(JobStatus::Succeeded, Some(answer), None);
                                    tracing::info!(
                                        alias = %member.alias,
                                        round_index,
                                        "batch member succeeded"
                                    );
                                }
                                RoundOutcome::Failed(failure) => {
                                    if failure.kind != FailureKind::Storage {
                                        member.record.record_round(round_index);
                                    }
                                    member.fail(failure);
                                }
                            }
                        }
                    }
                }
            }

            // 没有任何成员拿到回复的轮次不计入全局轮次
            if applied > 0 {
                global_round += 1;
            }
            self.publish(&batch_id, global_round, BatchStatus::Running, &mut members)
                .await;

            // 退避中的成员会进入下一次合并提交：先等待最长的退避时长
            if let Some(delay) = waits.iter().max() {
                tracing::debug!(
                    batch_id = %batch_id,
                    delay_ms = delay.as_millis() as u64,
                    "waiting for member backoff"
                );
                tokio::time::sleep(*delay).await;
            }
        };

        let views: Vec<MemberView> = members.iter().map(Member::view).collect();
        let counts = BatchCounts::from_members(&views);
        tracing::info!(
            batch_id = %batch_id,
            global_round,
            succeeded = counts.succeeded,
            failed = counts.failed,
            cancelled = counts.cancelled,
            "batch finished"
        );
        self.publish(&batch_id, global_round, final_status, &mut members)
            .await;
    }

    /// 合并提交（带重试）并轮询到完成或超时
    async fn run_remote(
        &self,
        batch_id: &str,
        items: Vec<BatchItem>,
    ) -> Result<Replies, GatewayError> {
        let gateway = self.executor.gateway();
        let mut attempt = 0u32;
        let handle = loop {
            match gateway.submit_batch(items.clone()).await {
                Ok(handle) => break handle,
                Err(e) => {
                    attempt += 1;
                    let action =
                        self.executor
                            .recovery()
                            .handle(&e, attempt, self.settings.submit_retries);
                    match action {
                        RecoveryAction::RetryAfter(delay) => {
                            tracing::warn!(
                                batch_id = %batch_id,
                                attempt,
                                error = %e,
                                "batch submission failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RecoveryAction::Fail(_) => return Err(e),
                    }
                }
            }
        };

        let interval = Duration::from_millis(self.settings.poll_interval_ms);
        let deadline = Instant::now() + Duration::from_secs(self.settings.poll_timeout_secs);
        let mut poll_failures = 0u32;
        loop {
            let mut wait = interval;
            match gateway.poll_batch(&handle).await {
                Ok(BatchPoll::Completed(replies)) => return Ok(replies),
                Ok(BatchPoll::Pending) => {
                    poll_failures = 0;
                    tracing::debug!(
                        batch_id = %batch_id,
                        remote_id = %handle.id,
                        "batch pending"
                    );
                }
                Err(e @ GatewayError::Rejected(_)) => {
                    tracing::warn!(batch_id = %batch_id, error = %e, "batch poll rejected");
                    return Err(e);
                }
                // 远端批次可能仍在运行：退避后继续轮询同一批次，不重新提交
                Err(e) => {
                    poll_failures += 1;
                    wait = wait.max(self.executor.recovery().backoff().delay(poll_failures));
                    tracing::warn!(
                        batch_id = %batch_id,
                        remote_id = %handle.id,
                        attempt = poll_failures,
                        error = %e,
                        "batch poll failed, polling again"
                    );
                }
            }
            if Instant::now() >= deadline {
                return Err(GatewayError::Transient(format!(
                    "batch {} not completed within {}s",
                    handle.id, self.settings.poll_timeout_secs
                )));
            }
            tokio::time::sleep(wait).await;
        }
    }
}

fn snapshot(
    batch_id: &str,
    global_round: u32,
    status: BatchStatus,
    members: &[Member],
) -> BatchView {
    let members: Vec<MemberView> = members.iter().map(Member::view).collect();
    BatchView {
        id: batch_id.to_string(),
        status,
        global_round,
        counts: BatchCounts::from_members(&members),
        members,
    }
}
