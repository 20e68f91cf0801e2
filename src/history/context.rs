//! 上下文重建：按轮次顺序回放存档
//!
//! 每一轮的上下文都由持久化的 Round 序列重建，而不是只保存在内存里，
//! 因此进程崩溃或取消后可以从任意轮次边界续跑。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::history::{ArtifactRef, Round, SessionId, SessionMeta, ToolCallStatus};

/// 单次工具调用在上下文中的投影（只含摘要）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub name: String,
    pub args: Value,
    pub status: ToolCallStatus,
    pub summary: String,
}

/// 历史中的一轮
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub round_index: u32,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<ArtifactRef>,
    pub tool_outcomes: Vec<ToolOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// 发给推理网关的可回放上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub session_id: SessionId,
    pub artifact: ArtifactRef,
    pub history: Vec<ContextEntry>,
    /// 本轮新提交的输入（首轮或续跑）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_input: Option<ArtifactRef>,
    /// 额外指令（如强制终局轮）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

impl Context {
    pub fn replay(meta: &SessionMeta, rounds: &[Round]) -> Self {
        let history = rounds
            .iter()
            .map(|r| ContextEntry {
                round_index: r.round_index,
                summary: r.model_summary.clone(),
                input: r.input.clone(),
                tool_outcomes: r
                    .tool_calls
                    .iter()
                    .map(|c| ToolOutcome {
                        name: c.name.clone(),
                        args: c.args.clone(),
                        status: c.status,
                        summary: c.result_summary.clone(),
                    })
                    .collect(),
                notes: r.notes.clone(),
            })
            .collect();
        Self {
            session_id: meta.id.clone(),
            artifact: meta.artifact.clone(),
            history,
            pending_input: None,
            instruction: None,
        }
    }

    pub fn with_input(mut self, input: Option<ArtifactRef>) -> Self {
        self.pending_input = input;
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    /// 最后一轮的序号，无历史时为 0
    pub fn last_round(&self) -> u32 {
        self.history.last().map(|e| e.round_index).unwrap_or(0)
    }

    /// 纯文本形式的历史（供只接受文本的后端使用）
    pub fn transcript(&self) -> Vec<String> {
        self.history
            .iter()
            .map(|entry| {
                let summary = if entry.summary.is_empty() {
                    "(no summary)"
                } else {
                    entry.summary.as_str()
                };
                let mut segments = vec![format!("[round {}] {}", entry.round_index, summary)];
                if let Some(input) = &entry.input {
                    segments.push(format!("input: {}", input.location));
                }
                if !entry.tool_outcomes.is_empty() {
                    let calls: Vec<String> = entry
                        .tool_outcomes
                        .iter()
                        .map(|t| {
                            let mark = match t.status {
                                ToolCallStatus::Success => "",
                                ToolCallStatus::Failure => " (failed)",
                            };
                            format!("{}({}){} -> {}", t.name, t.args, mark, t.summary)
                        })
                        .collect();
                    segments.push(format!("tools: {}", calls.join(" | ")));
                }
                for note in &entry.notes {
                    segments.push(format!("note: {}", note));
                }
                segments.join("\n")
            })
            .collect()
    }
}
