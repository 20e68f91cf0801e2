//! 集成测试共用：配置、网关包装、故障工具

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use folio::config::AppConfig;
use folio::core::{Runtime, RuntimeBuilder};
use folio::history::{Backend, Context};
use folio::llm::{
    BatchHandle, BatchItem, BatchPoll, GatewayError, InferenceGateway, ModelReply, ScriptedGateway,
    ToolRequest,
};
use folio::tools::{EchoTool, Tool, ToolRegistry, ToolSpec};
use serde_json::Value;

/// 内存存储 + 毫秒级退避与轮询
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.store.backend = "memory".to_string();
    config.rounds.backoff_initial_ms = 1;
    config.rounds.backoff_max_ms = 4;
    config.batch.poll_interval_ms = 1;
    config.batch.poll_timeout_secs = 5;
    config.tools.timeout_secs = 2;
    config
}

pub fn registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(BrokenLookup);
    registry
}

pub fn runtime(config: AppConfig, gateway: Arc<dyn InferenceGateway>) -> Runtime {
    RuntimeBuilder::new(config)
        .with_gateway(gateway)
        .with_registry(registry())
        .build()
}

pub fn echo_round() -> ModelReply {
    ModelReply::tools(
        "checking catalogue",
        vec![ToolRequest::new("echo", serde_json::json!({"text": "hit"}))],
    )
}

pub fn answer(title: &str) -> ModelReply {
    ModelReply::answer("identified", serde_json::json!({ "title": title }))
}

/// 主备后端都失败的检索工具
pub struct BrokenLookup;

#[async_trait]
impl Tool for BrokenLookup {
    fn name(&self) -> &str {
        "broken_lookup"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn has_fallback(&self) -> bool {
        true
    }

    async fn invoke(&self, backend: Backend, _args: &Value) -> Result<Value, String> {
        Err(format!("{backend} backend unavailable"))
    }
}

/// 每次交互式调用前等待固定时长，用于在轮次进行中触发取消
pub struct DelayedGateway {
    pub inner: ScriptedGateway,
    pub delay: Duration,
}

#[async_trait]
impl InferenceGateway for DelayedGateway {
    async fn call(&self, context: &Context, tools: &[ToolSpec]) -> Result<ModelReply, GatewayError> {
        tokio::time::sleep(self.delay).await;
        self.inner.call(context, tools).await
    }

    async fn submit_batch(&self, items: Vec<BatchItem>) -> Result<BatchHandle, GatewayError> {
        self.inner.submit_batch(items).await
    }

    async fn poll_batch(&self, handle: &BatchHandle) -> Result<BatchPoll, GatewayError> {
        tokio::time::sleep(self.delay).await;
        self.inner.poll_batch(handle).await
    }
}
