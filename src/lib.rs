//! Folio - 多轮、工具增强的文献图像分析编排引擎
//!
//! 模块划分：
//! - **history**: 会话 / 轮次数据模型、追加式轮次存储（JSONL / 内存）、上下文回放
//! - **tools**: 工具注册表、分发器（超时、主备切换、审计日志）、HTTP 检索工具
//! - **llm**: 推理网关抽象与实现（HTTP / Scripted）
//! - **rounds**: 轮次执行器（prepare / apply / advance）与进度事件
//! - **jobs**: 单作业控制器（状态机、协作式取消、续跑）
//! - **batch**: 批量调度器（全局轮次、合并批次调用）
//! - **core**: 失败分类、重试与退避、运行时装配
//! - **config**: 应用配置加载（TOML + 环境变量）

pub mod batch;
pub mod config;
pub mod core;
pub mod history;
pub mod jobs;
pub mod llm;
pub mod observability;
pub mod rounds;
pub mod tools;
