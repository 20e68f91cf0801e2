//! 轮次执行器
//!
//! 每一轮：从存档回放上下文 → 调用推理网关 → 分类回复：
//! 工具请求则经 ToolDispatcher 执行并追加中间轮；终局答案则追加终局轮。
//! 网关瞬时失败按 RecoveryEngine 退避重试同一轮；工具失败只记入 ToolCallRecord。
//!
//! prepare / apply 拆开，批量调度器与交互式 advance 共用同一套分类与持久化逻辑。

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::RoundsSection;
use crate::core::{Failure, FailureKind, RecoveryAction, RecoveryEngine};
use crate::history::{ArtifactRef, Context, Round, RoundStore, SessionMeta, StoreError};
use crate::llm::{InferenceGateway, ModelReply};
use crate::rounds::{RoundEvent, SessionLeases};
use crate::tools::{summarize, ToolDispatcher, ToolSpec};

/// 强制终局轮附加给模型的指令
pub const FINAL_ANSWER_INSTRUCTION: &str =
    "No further tool calls are available. Produce the final structured answer now from the evidence gathered so far.";

pub const NOTE_NO_TOOL_CALLS: &str = "no tool calls requested";

/// 单个作业可使用的轮次窗口：从 first_round 起最多 max_rounds 个工具轮，之后一轮强制终局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunWindow {
    pub session_id: String,
    pub first_round: u32,
}

impl RunWindow {
    pub fn new(session_id: impl Into<String>, first_round: u32) -> Self {
        Self {
            session_id: session_id.into(),
            first_round: first_round.max(1),
        }
    }
}

/// 为什么本轮被强制为终局轮
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceReason {
    /// 本作业的轮数预算已用完
    Budget,
    /// 上一轮模型既没有请求工具也没有给出答案
    Stall,
}

impl ForceReason {
    fn failure_kind(self) -> FailureKind {
        match self {
            ForceReason::Budget => FailureKind::RoundBudgetExhausted,
            ForceReason::Stall => FailureKind::MissingFinalAnswer,
        }
    }
}

/// 一轮请求的全部输入（尚未调用网关）
#[derive(Debug, Clone)]
pub struct PreparedRound {
    pub session_id: String,
    pub round_index: u32,
    pub context: Context,
    pub catalog: Vec<ToolSpec>,
    pub force: Option<ForceReason>,
    /// 本轮允许的网关重试次数
    pub max_retries: u32,
    pub input: Option<ArtifactRef>,
}

impl PreparedRound {
    pub fn is_forced(&self) -> bool {
        self.force.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    Continue { round_index: u32 },
    Done { round_index: u32, answer: Value },
    Failed(Failure),
}

impl RoundOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RoundOutcome::Continue { .. })
    }
}

pub struct RoundExecutor {
    gateway: Arc<dyn InferenceGateway>,
    store: Arc<dyn RoundStore>,
    dispatcher: Arc<ToolDispatcher>,
    recovery: RecoveryEngine,
    settings: RoundsSection,
    event_tx: Option<mpsc::UnboundedSender<RoundEvent>>,
    leases: Arc<SessionLeases>,
}

impl RoundExecutor {
    pub fn new(
        gateway: Arc<dyn InferenceGateway>,
        store: Arc<dyn RoundStore>,
        dispatcher: Arc<ToolDispatcher>,
        settings: RoundsSection,
    ) -> Self {
        Self {
            gateway,
            store,
            dispatcher,
            recovery: RecoveryEngine::new(settings.backoff()),
            settings,
            event_tx: None,
            leases: SessionLeases::new(),
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RoundEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn gateway(&self) -> &Arc<dyn InferenceGateway> {
        &self.gateway
    }

    pub fn store(&self) -> &Arc<dyn RoundStore> {
        &self.store
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    pub fn settings(&self) -> &RoundsSection {
        &self.settings
    }

    /// 会话写入租约（单作业与批次共用）
    pub fn leases(&self) -> &Arc<SessionLeases> {
        &self.leases
    }

    fn emit(&self, event: RoundEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// 新建会话并写入会话头
    pub async fn create_session(&self, artifact: ArtifactRef) -> Result<SessionMeta, StoreError> {
        let meta = SessionMeta::new(artifact);
        self.store.create_session(&meta).await?;
        tracing::info!(session_id = %meta.id, artifact = %meta.artifact.location, "session created");
        Ok(meta)
    }

    /// 为已有会话开启一个新窗口：编号从 last + 1 继续
    pub async fn open_window(&self, session_id: &str) -> Result<RunWindow, StoreError> {
        let rounds = self.store.load(session_id).await?;
        let last = rounds.last().map(|r| r.round_index).unwrap_or(0);
        Ok(RunWindow::new(session_id, last + 1))
    }

    /// 构造下一轮请求：回放存档、决定是否强制终局、选择工具目录与重试上限
    pub async fn prepare(
        &self,
        run: &RunWindow,
        new_input: Option<ArtifactRef>,
    ) -> Result<PreparedRound, Failure> {
        let meta = self.store.session(&run.session_id).await?;
        let rounds = self.store.load(&run.session_id).await?;
        if rounds.last().map(|r| r.is_final).unwrap_or(false) {
            return Err(Failure::new(
                FailureKind::Storage,
                format!("session {} already has a final round", run.session_id),
            ));
        }

        let round_index = rounds.last().map(|r| r.round_index).unwrap_or(0) + 1;
        let budget_end = run
            .first_round
            .saturating_sub(1)
            .saturating_add(self.settings.max_rounds);
        let stalled = rounds
            .last()
            .map(|r| r.round_index >= run.first_round && r.tool_calls.is_empty())
            .unwrap_or(false);
        let force = if round_index > budget_end {
            Some(ForceReason::Budget)
        } else if stalled {
            Some(ForceReason::Stall)
        } else {
            None
        };

        let mut context = Context::replay(&meta, &rounds).with_input(new_input.clone());
        let (catalog, max_retries) = match force {
            Some(_) => {
                context = context.with_instruction(FINAL_ANSWER_INSTRUCTION);
                (Vec::new(), self.settings.final_retries)
            }
            None => (self.dispatcher.catalog(), self.settings.normal_retries),
        };

        Ok(PreparedRound {
            session_id: run.session_id.clone(),
            round_index,
            context,
            catalog,
            force,
            max_retries,
            input: new_input,
        })
    }

    /// 处理一条模型回复：执行工具、持久化本轮、给出结果
    pub async fn apply(&self, prepared: PreparedRound, reply: ModelReply) -> RoundOutcome {
        let session_id = prepared.session_id.clone();
        let round_index = prepared.round_index;

        let (round, outcome) = match reply {
            ModelReply::FinalAnswer { summary, answer } => {
                let round = Round::terminal(round_index, self.compact(&summary), answer.clone())
                    .with_input(prepared.input);
                (round, RoundOutcome::Done { round_index, answer })
            }
            ModelReply::ToolRequests { summary, requests } => match prepared.force {
                Some(reason) => {
                    let ignored: Vec<&str> = requests.iter().map(|r| r.name.as_str()).collect();
                    let note = if ignored.is_empty() {
                        "forced final round: no answer produced".to_string()
                    } else {
                        format!("forced final round: ignored tool requests [{}]", ignored.join(", "))
                    };
                    let round = Round::intermediate(round_index, self.compact(&summary), Vec::new())
                        .with_input(prepared.input)
                        .with_note(note);
                    let failure = match reason {
                        ForceReason::Budget => Failure::new(
                            reason.failure_kind(),
                            format!(
                                "no final answer after {} rounds (stopped at round {})",
                                self.settings.max_rounds, round_index
                            ),
                        ),
                        ForceReason::Stall => Failure::new(
                            reason.failure_kind(),
                            format!("model stopped calling tools without answering (round {round_index})"),
                        ),
                    };
                    (round, RoundOutcome::Failed(failure))
                }
                None if requests.is_empty() => {
                    let round = Round::intermediate(round_index, self.compact(&summary), Vec::new())
                        .with_input(prepared.input)
                        .with_note(NOTE_NO_TOOL_CALLS);
                    (round, RoundOutcome::Continue { round_index })
                }
                None => {
                    for req in &requests {
                        self.emit(RoundEvent::ToolCall {
                            session_id: session_id.clone(),
                            round_index,
                            tool: req.name.clone(),
                            args: req.args.clone(),
                        });
                    }
                    let records = self.dispatcher.invoke_all(&requests).await;
                    for record in &records {
                        self.emit(RoundEvent::ToolResult {
                            session_id: session_id.clone(),
                            round_index,
                            tool: record.name.clone(),
                            ok: record.is_success(),
                            summary: record.result_summary.clone(),
                        });
                    }
                    let round = Round::intermediate(round_index, self.compact(&summary), records)
                        .with_input(prepared.input);
                    (round, RoundOutcome::Continue { round_index })
                }
            },
        };

        if let Err(e) = self.store.append(&session_id, &round).await {
            tracing::error!(session_id = %session_id, round_index, error = %e, "failed to persist round");
            let outcome = RoundOutcome::Failed(Failure::from(e));
            self.finish(&session_id, round_index, &outcome);
            return outcome;
        }
        tracing::info!(
            session_id = %session_id,
            round_index,
            tool_calls = round.tool_calls.len(),
            is_final = round.is_final,
            "round persisted"
        );
        self.emit(RoundEvent::RoundPersisted {
            session_id: session_id.clone(),
            round_index,
            is_final: round.is_final,
        });
        self.finish(&session_id, round_index, &outcome);
        outcome
    }

    /// 交互式推进一轮：prepare → call（瞬时失败退避重试）→ apply
    pub async fn advance(&self, run: &RunWindow, new_input: Option<ArtifactRef>) -> RoundOutcome {
        let prepared = match self.prepare(run, new_input).await {
            Ok(p) => p,
            Err(f) => return RoundOutcome::Failed(f),
        };
        self.emit(RoundEvent::RoundStarted {
            session_id: prepared.session_id.clone(),
            round_index: prepared.round_index,
            forced: prepared.is_forced(),
        });
        if let Some(reason) = prepared.force {
            tracing::info!(
                session_id = %prepared.session_id,
                round_index = prepared.round_index,
                reason = ?reason,
                "forcing final answer round"
            );
        }

        let mut failures = 0u32;
        loop {
            match self.gateway.call(&prepared.context, &prepared.catalog).await {
                Ok(reply) => return self.apply(prepared, reply).await,
                Err(e) => {
                    failures += 1;
                    match self.recovery.handle(&e, failures, prepared.max_retries) {
                        RecoveryAction::RetryAfter(delay) => {
                            tracing::warn!(
                                session_id = %prepared.session_id,
                                round_index = prepared.round_index,
                                attempt = failures,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "gateway call failed, retrying"
                            );
                            self.emit(RoundEvent::Retry {
                                session_id: prepared.session_id.clone(),
                                round_index: prepared.round_index,
                                attempt: failures,
                                delay_ms: delay.as_millis() as u64,
                                reason: e.to_string(),
                            });
                            tokio::time::sleep(delay).await;
                        }
                        RecoveryAction::Fail(failure) => {
                            tracing::warn!(
                                session_id = %prepared.session_id,
                                round_index = prepared.round_index,
                                failure = %failure,
                                "round abandoned"
                            );
                            let outcome = RoundOutcome::Failed(failure);
                            self.finish(&prepared.session_id, prepared.round_index, &outcome);
                            return outcome;
                        }
                    }
                }
            }
        }
    }

    /// 终态时推送 Finished 事件
    pub(crate) fn finish(&self, session_id: &str, round_index: u32, outcome: &RoundOutcome) {
        let label = match outcome {
            RoundOutcome::Continue { .. } => return,
            RoundOutcome::Done { .. } => "done".to_string(),
            RoundOutcome::Failed(f) => format!("failed: {f}"),
        };
        self.emit(RoundEvent::Finished {
            session_id: session_id.to_string(),
            round_index,
            outcome: label,
        });
    }

    fn compact(&self, summary: &str) -> String {
        summarize(summary, self.settings.max_summary_chars)
    }
}
