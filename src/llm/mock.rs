//! Scripted 网关（用于测试与离线演示，无需真实推理服务）
//!
//! 按输入文献位置（artifact.location）为每个会话预置回复脚本；脚本耗尽后使用默认步骤。
//! 批量接口同样按脚本出结果，ScriptStep::Omit 表示该项在批量结果中缺失。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::history::Context;
use crate::llm::{BatchHandle, BatchItem, BatchPoll, GatewayError, InferenceGateway, ModelReply};
use crate::tools::ToolSpec;

/// 脚本中的一步
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(ModelReply),
    Error(GatewayError),
    /// 仅对批量接口有意义：结果中不返回该 alias（交互式调用时按 Transient 处理）
    Omit,
}

/// 一次被记录的调用（供测试断言）
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub location: String,
    pub next_round: u32,
    pub tool_count: usize,
    pub instruction: Option<String>,
    pub batched: bool,
}

struct PendingBatch {
    results: HashMap<String, Result<ModelReply, GatewayError>>,
    polls_left: u32,
}

pub struct ScriptedGateway {
    scripts: Mutex<HashMap<String, VecDeque<ScriptStep>>>,
    default_step: ScriptStep,
    calls: Mutex<Vec<RecordedCall>>,
    batches: Mutex<HashMap<String, PendingBatch>>,
    /// 每个批次在完成前返回 Pending 的次数
    pending_polls: u32,
    /// 接下来若干次 submit_batch 直接失败
    submit_failures: AtomicU32,
    /// 接下来若干次 poll_batch 返回可重试错误
    poll_failures: AtomicU32,
    batch_submissions: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(default_step: ScriptStep) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_step,
            calls: Mutex::new(Vec::new()),
            batches: Mutex::new(HashMap::new()),
            pending_polls: 0,
            submit_failures: AtomicU32::new(0),
            poll_failures: AtomicU32::new(0),
            batch_submissions: AtomicUsize::new(0),
        }
    }

    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn with_submit_failures(self, failures: u32) -> Self {
        self.submit_failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn with_poll_failures(self, failures: u32) -> Self {
        self.poll_failures.store(failures, Ordering::SeqCst);
        self
    }

    /// 为某个文献位置预置脚本
    pub async fn script(&self, location: impl Into<String>, steps: Vec<ScriptStep>) {
        self.scripts
            .lock()
            .await
            .entry(location.into())
            .or_default()
            .extend(steps);
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub fn batch_submissions(&self) -> usize {
        self.batch_submissions.load(Ordering::SeqCst)
    }

    async fn next_step(&self, context: &Context, tools: &[ToolSpec], batched: bool) -> ScriptStep {
        self.calls.lock().await.push(RecordedCall {
            location: context.artifact.location.clone(),
            next_round: context.last_round() + 1,
            tool_count: tools.len(),
            instruction: context.instruction.clone(),
            batched,
        });
        self.scripts
            .lock()
            .await
            .get_mut(&context.artifact.location)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default_step.clone())
    }
}

#[async_trait]
impl InferenceGateway for ScriptedGateway {
    async fn call(&self, context: &Context, tools: &[ToolSpec]) -> Result<ModelReply, GatewayError> {
        match self.next_step(context, tools, false).await {
            ScriptStep::Reply(reply) => Ok(reply),
            ScriptStep::Error(e) => Err(e),
            ScriptStep::Omit => Err(GatewayError::Transient("no reply".to_string())),
        }
    }

    async fn submit_batch(&self, items: Vec<BatchItem>) -> Result<BatchHandle, GatewayError> {
        let remaining = self.submit_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.submit_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(GatewayError::Transient("batch endpoint overloaded".to_string()));
        }
        self.batch_submissions.fetch_add(1, Ordering::SeqCst);

        let mut results = HashMap::new();
        for item in items {
            match self.next_step(&item.context, &item.tools, true).await {
                ScriptStep::Reply(reply) => {
                    results.insert(item.alias, Ok(reply));
                }
                ScriptStep::Error(e) => {
                    results.insert(item.alias, Err(e));
                }
                ScriptStep::Omit => {}
            }
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.batches.lock().await.insert(
            id.clone(),
            PendingBatch {
                results,
                polls_left: self.pending_polls,
            },
        );
        Ok(BatchHandle { id })
    }

    async fn poll_batch(&self, handle: &BatchHandle) -> Result<BatchPoll, GatewayError> {
        let remaining = self.poll_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.poll_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(GatewayError::Transient("HTTP 503 on status GET".to_string()));
        }
        let mut batches = self.batches.lock().await;
        let Some(batch) = batches.get_mut(&handle.id) else {
            return Err(GatewayError::Rejected(format!("unknown batch {}", handle.id)));
        };
        if batch.polls_left > 0 {
            batch.polls_left -= 1;
            return Ok(BatchPoll::Pending);
        }
        let done = batches
            .remove(&handle.id)
            .map(|b| b.results)
            .unwrap_or_default();
        Ok(BatchPoll::Completed(done))
    }
}
