//! 轮次执行过程中推送的进度事件（供 CLI 或上层观察，不影响执行）

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RoundEvent {
    /// 开始一轮（forced 表示强制终局轮，工具目录为空）
    RoundStarted {
        session_id: String,
        round_index: u32,
        forced: bool,
    },
    /// 调用工具
    ToolCall {
        session_id: String,
        round_index: u32,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（摘要）
    ToolResult {
        session_id: String,
        round_index: u32,
        tool: String,
        ok: bool,
        summary: String,
    },
    /// 网关瞬时失败，等待后重试同一轮
    Retry {
        session_id: String,
        round_index: u32,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    /// 本轮已持久化
    RoundPersisted {
        session_id: String,
        round_index: u32,
        is_final: bool,
    },
    /// 会话在本轮结束（成功或失败）
    Finished {
        session_id: String,
        round_index: u32,
        outcome: String,
    },
}
