//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FOLIO__*` 覆盖（双下划线表示嵌套，如 `FOLIO__ROUNDS__MAX_ROUNDS=8`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::BackoffPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub gateway: GatewaySection,
    pub rounds: RoundsSection,
    pub tools: ToolsSection,
    pub jobs: JobsSection,
    pub batch: BatchSection,
    pub store: StoreSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 数据根目录（会话存档默认位于 data_dir/sessions）
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "folio".to_string(),
            data_dir: PathBuf::from("data"),
        }
    }
}

/// [gateway] 段：推理网关地址与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8700".to_string(),
            api_key: None,
            request_timeout_secs: 120,
        }
    }
}

/// [rounds] 段：轮数上限、重试次数、退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoundsSection {
    /// 单个作业最多的工具轮数（不含强制终局轮）
    pub max_rounds: u32,
    /// 普通轮的重试次数
    pub normal_retries: u32,
    /// 强制终局轮的重试次数
    pub final_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: u32,
    pub backoff_max_ms: u64,
    /// 模型摘要最大字符数
    pub max_summary_chars: usize,
}

impl Default for RoundsSection {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            normal_retries: 3,
            final_retries: 5,
            backoff_initial_ms: 10_000,
            backoff_multiplier: 2,
            backoff_max_ms: 60_000,
            max_summary_chars: 600,
        }
    }
}

impl RoundsSection {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_ms: self.backoff_initial_ms,
            multiplier: self.backoff_multiplier,
            max_ms: self.backoff_max_ms,
        }
    }
}

/// [tools] 段：超时、摘要长度、并发、HTTP 检索端点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub timeout_secs: u64,
    pub max_summary_chars: usize,
    /// 单轮内并发执行的工具调用数
    pub max_concurrent: usize,
    /// 检索响应体最大字符数（摘要之前）
    pub max_body_chars: usize,
    pub lookups: Vec<LookupSection>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_summary_chars: 240,
            max_concurrent: 3,
            max_body_chars: 8000,
            lookups: Vec::new(),
        }
    }
}

/// [[tools.lookups]]：一个 HTTP 检索工具（主端点 + 可选回退端点）
#[derive(Debug, Clone, Deserialize)]
pub struct LookupSection {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub primary_url: String,
    #[serde(default)]
    pub fallback_url: Option<String>,
    /// 必填参数名（均为字符串类型）
    #[serde(default)]
    pub required: Vec<String>,
    /// 可选参数名
    #[serde(default)]
    pub optional: Vec<String>,
}

/// [jobs] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    /// 同时运行的单作业数
    pub max_concurrent: usize,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// [batch] 段：轮询间隔、单轮轮询上限、全局轮数上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    pub poll_interval_ms: u64,
    pub poll_timeout_secs: u64,
    pub max_global_rounds: u32,
    /// 合并批次提交失败时的重试次数
    pub submit_retries: u32,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            poll_timeout_secs: 3_600,
            max_global_rounds: 10,
            submit_retries: 3,
        }
    }
}

/// [store] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// jsonl / memory
    pub backend: String,
    /// 未设置时为 app.data_dir/sessions
    pub dir: Option<PathBuf>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: "jsonl".to_string(),
            dir: None,
        }
    }
}

impl AppConfig {
    pub fn sessions_dir(&self) -> PathBuf {
        self.store
            .dir
            .clone()
            .unwrap_or_else(|| self.app.data_dir.join("sessions"))
    }
}

/// 从 config 目录加载配置，环境变量 FOLIO__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FOLIO__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FOLIO")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
