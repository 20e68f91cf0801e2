//! 推理网关抽象
//!
//! 所有后端（HTTP / Scripted）实现 InferenceGateway：交互式单次调用 call，
//! 以及异步批量接口 submit_batch + poll_batch。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::history::Context;
use crate::tools::ToolSpec;

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// 模型回复：工具请求或终局答案
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelReply {
    ToolRequests {
        #[serde(default)]
        summary: String,
        #[serde(default)]
        requests: Vec<ToolRequest>,
    },
    FinalAnswer {
        #[serde(default)]
        summary: String,
        answer: Value,
    },
}

impl ModelReply {
    pub fn tools(summary: impl Into<String>, requests: Vec<ToolRequest>) -> Self {
        ModelReply::ToolRequests {
            summary: summary.into(),
            requests,
        }
    }

    pub fn answer(summary: impl Into<String>, answer: Value) -> Self {
        ModelReply::FinalAnswer {
            summary: summary.into(),
            answer,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// 过载、超时、连接失败：可重试
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// 请求被拒绝或回复无法解析：不可重试
    #[error("upstream rejected request: {0}")]
    Rejected(String),
}

/// 批量请求中的一项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItem {
    pub alias: String,
    pub context: Context,
    pub tools: Vec<ToolSpec>,
}

/// 已提交批次的句柄
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHandle {
    pub id: String,
}

/// 批次轮询结果
#[derive(Debug, Clone)]
pub enum BatchPoll {
    Pending,
    /// alias -> 回复或单项错误；缺失的 alias 表示网关未返回该项
    Completed(HashMap<String, Result<ModelReply, GatewayError>>),
}

#[async_trait]
pub trait InferenceGateway: Send + Sync {
    /// 交互式调用：上下文 + 工具目录 -> 工具请求或终局答案
    async fn call(&self, context: &Context, tools: &[ToolSpec]) -> Result<ModelReply, GatewayError>;

    /// 提交合并批次，立即返回句柄
    async fn submit_batch(&self, items: Vec<BatchItem>) -> Result<BatchHandle, GatewayError>;

    /// 查询批次状态，不阻塞等待
    async fn poll_batch(&self, handle: &BatchHandle) -> Result<BatchPoll, GatewayError>;
}
