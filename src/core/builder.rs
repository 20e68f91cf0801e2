//! 运行时构建器：统一的组件初始化逻辑
//!
//! 按配置组装 存储 → 工具注册表 → 分发器 → 轮次执行器 → 单作业控制器 / 批量调度器，
//! CLI 与测试共用同一套装配。

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::batch::BatchScheduler;
use crate::config::AppConfig;
use crate::history::{JsonlRoundStore, MemoryRoundStore, RoundStore};
use crate::jobs::JobController;
use crate::llm::{HttpGateway, InferenceGateway};
use crate::rounds::{RoundEvent, RoundExecutor};
use crate::tools::{build_registry, ToolDispatcher, ToolRegistry};

/// 装配完成的运行时
pub struct Runtime {
    pub executor: Arc<RoundExecutor>,
    pub jobs: Arc<JobController>,
    pub batches: Arc<BatchScheduler>,
}

pub struct RuntimeBuilder {
    config: AppConfig,
    gateway: Option<Arc<dyn InferenceGateway>>,
    store: Option<Arc<dyn RoundStore>>,
    registry: Option<ToolRegistry>,
    event_tx: Option<mpsc::UnboundedSender<RoundEvent>>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            gateway: None,
            store: None,
            registry: None,
            event_tx: None,
        }
    }

    /// 替换推理网关（离线演示、测试）
    pub fn with_gateway(mut self, gateway: Arc<dyn InferenceGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RoundStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RoundEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn build_store(&self) -> Arc<dyn RoundStore> {
        match self.config.store.backend.as_str() {
            "memory" => Arc::new(MemoryRoundStore::new()),
            "jsonl" => Arc::new(JsonlRoundStore::new(self.config.sessions_dir())),
            other => {
                tracing::warn!(backend = %other, "unknown store backend, using jsonl");
                Arc::new(JsonlRoundStore::new(self.config.sessions_dir()))
            }
        }
    }

    pub fn build(self) -> Runtime {
        let store = self.store.clone().unwrap_or_else(|| self.build_store());
        let gateway = self.gateway.clone().unwrap_or_else(|| {
            let gw = &self.config.gateway;
            let http: Arc<dyn InferenceGateway> = Arc::new(HttpGateway::new(
                gw.base_url.clone(),
                gw.api_key.clone(),
                gw.request_timeout_secs,
            ));
            http
        });
        let tools = &self.config.tools;
        let registry = self
            .registry
            .unwrap_or_else(|| build_registry(tools));
        tracing::info!(tools = ?registry.tool_names(), "tool registry ready");
        let dispatcher = Arc::new(ToolDispatcher::new(
            registry,
            tools.timeout_secs,
            tools.max_summary_chars,
            tools.max_concurrent,
        ));

        let mut executor =
            RoundExecutor::new(gateway, store, dispatcher, self.config.rounds.clone());
        if let Some(tx) = self.event_tx {
            executor = executor.with_events(tx);
        }
        let executor = Arc::new(executor);

        Runtime {
            jobs: JobController::new(executor.clone(), self.config.jobs.max_concurrent),
            batches: BatchScheduler::new(executor.clone(), self.config.batch.clone()),
            executor,
        }
    }
}
