//! 会话与轮次数据模型
//!
//! Round 一经写入即不可变；ToolCallRecord 只保存有界摘要，完整工具返回不会回放到后续轮次。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 会话 ID（uuid v4 字符串）
pub type SessionId = String;

/// 输入文献的引用（路径或 URI），本系统不读取其内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl ArtifactRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            media_type: None,
        }
    }

    /// 文件名主干，用作批量别名前缀
    pub fn label(&self) -> String {
        let name = self
            .location
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.location);
        let stem = match name.rfind('.') {
            Some(idx) if idx > 0 => &name[..idx],
            _ => name,
        };
        if stem.is_empty() {
            "doc".to_string()
        } else {
            stem.to_string()
        }
    }
}

/// 会话头：创建时写入一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: SessionId,
    pub artifact: ArtifactRef,
    pub created_at: DateTime<Utc>,
}

impl SessionMeta {
    pub fn new(artifact: ArtifactRef) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            artifact,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Success,
    Failure,
}

/// 实际服务本次调用的后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Primary,
    Fallback,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Primary => f.write_str("primary"),
            Backend::Fallback => f.write_str("fallback"),
        }
    }
}

/// 工具调用失败原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolFailure {
    UnknownTool,
    Timeout { secs: u64 },
    Handler { detail: String },
}

impl std::fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolFailure::UnknownTool => f.write_str("unknown tool"),
            ToolFailure::Timeout { secs } => write!(f, "timed out after {secs}s"),
            ToolFailure::Handler { detail } => f.write_str(detail),
        }
    }
}

/// 单次工具调用的存档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub args: Value,
    pub result_summary: String,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
    /// 未找到处理器（UnknownTool）时为 None
    #[serde(default)]
    pub backend: Option<Backend>,
}

impl ToolCallRecord {
    pub fn success(name: &str, args: Value, summary: String, backend: Backend) -> Self {
        Self {
            name: name.to_string(),
            args,
            result_summary: summary,
            status: ToolCallStatus::Success,
            error: None,
            backend: Some(backend),
        }
    }

    pub fn failure(
        name: &str,
        args: Value,
        error: ToolFailure,
        backend: Option<Backend>,
        summary: String,
    ) -> Self {
        Self {
            name: name.to_string(),
            args,
            result_summary: summary,
            status: ToolCallStatus::Failure,
            error: Some(error),
            backend,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolCallStatus::Success
    }
}

/// 一轮：一次模型调用 + 零或多次工具调用，或终局答案
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub round_index: u32,
    pub timestamp: DateTime<Utc>,
    pub model_summary: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// 续跑时随本轮提交的新输入
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Round {
    pub fn intermediate(
        round_index: u32,
        model_summary: String,
        tool_calls: Vec<ToolCallRecord>,
    ) -> Self {
        Self {
            round_index,
            timestamp: Utc::now(),
            model_summary,
            tool_calls,
            is_final: false,
            result: None,
            input: None,
            notes: Vec::new(),
        }
    }

    pub fn terminal(round_index: u32, model_summary: String, result: Value) -> Self {
        Self {
            round_index,
            timestamp: Utc::now(),
            model_summary,
            tool_calls: Vec::new(),
            is_final: true,
            result: Some(result),
            input: None,
            notes: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: Option<ArtifactRef>) -> Self {
        self.input = input;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}
