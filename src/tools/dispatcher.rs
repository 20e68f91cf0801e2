//! 工具分发器
//!
//! 持有 ToolRegistry、单次调用超时与摘要长度上限；invoke(name, args) 永远返回 ToolCallRecord，
//! 不向上抛错：未知工具、超时、处理器失败都记录为 failure，本轮继续。
//! 配置了回退后端的工具在主后端失败后切换，实际服务的后端显式写入记录。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::history::{Backend, ToolCallRecord, ToolFailure};
use crate::llm::ToolRequest;
use crate::tools::{Tool, ToolRegistry, ToolSpec};

pub struct ToolDispatcher {
    registry: ToolRegistry,
    timeout: Duration,
    max_summary_chars: usize,
    /// 单轮内并发执行的工具数
    permits: Arc<Semaphore>,
}

impl ToolDispatcher {
    pub fn new(
        registry: ToolRegistry,
        timeout_secs: u64,
        max_summary_chars: usize,
        max_concurrent: usize,
    ) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
            max_summary_chars,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn catalog(&self) -> Vec<ToolSpec> {
        self.registry.catalog()
    }

    /// 执行一轮内的全部工具请求；可并发执行，结果按原请求顺序返回
    pub async fn invoke_all(&self, requests: &[ToolRequest]) -> Vec<ToolCallRecord> {
        join_all(
            requests
                .iter()
                .map(|r| self.invoke(&r.name, r.args.clone())),
        )
        .await
    }

    pub async fn invoke(&self, name: &str, args: Value) -> ToolCallRecord {
        let _permit = self.permits.clone().acquire_owned().await.ok();
        let start = Instant::now();

        let record = match self.registry.get(name) {
            None => ToolCallRecord::failure(
                name,
                args,
                ToolFailure::UnknownTool,
                None,
                format!("Unknown tool: {name}"),
            ),
            Some(tool) => self.invoke_tool(tool.as_ref(), name, args).await,
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": record.is_success(),
            "backend": record.backend.map(|b| b.to_string()),
            "error": record.error.as_ref().map(|e| e.to_string()),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&record.args),
        });
        if record.is_success() {
            tracing::info!(audit = %audit, "tool");
        } else {
            tracing::warn!(audit = %audit, "tool");
        }
        record
    }

    async fn invoke_tool(&self, tool: &dyn Tool, name: &str, args: Value) -> ToolCallRecord {
        let primary = self.run_backend(tool, Backend::Primary, &args).await;
        let primary_err = match primary {
            Ok(value) => {
                let summary = summarize(&render(&value), self.max_summary_chars);
                return ToolCallRecord::success(name, args, summary, Backend::Primary);
            }
            Err(e) => e,
        };

        if !tool.has_fallback() {
            let summary = summarize(&primary_err.to_string(), self.max_summary_chars);
            return ToolCallRecord::failure(name, args, primary_err, Some(Backend::Primary), summary);
        }

        tracing::warn!(tool = %name, error = %primary_err, "primary backend failed, switching to fallback");
        match self.run_backend(tool, Backend::Fallback, &args).await {
            Ok(value) => {
                let summary = summarize(&render(&value), self.max_summary_chars);
                ToolCallRecord::success(name, args, summary, Backend::Fallback)
            }
            Err(fallback_err) => {
                let error = ToolFailure::Handler {
                    detail: format!("primary: {primary_err}; fallback: {fallback_err}"),
                };
                let summary = summarize(&error.to_string(), self.max_summary_chars);
                ToolCallRecord::failure(name, args, error, Some(Backend::Fallback), summary)
            }
        }
    }

    async fn run_backend(
        &self,
        tool: &dyn Tool,
        backend: Backend,
        args: &Value,
    ) -> Result<Value, ToolFailure> {
        match timeout(self.timeout, tool.invoke(backend, args)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(detail)) => Err(ToolFailure::Handler { detail }),
            Err(_) => Err(ToolFailure::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 折叠空白并截断到 max_chars 个字符（超出时以 ... 结尾）
pub fn summarize(text: &str, max_chars: usize) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() <= max_chars {
        return cleaned;
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = cleaned.chars().take(keep).collect();
    out.push_str("...");
    out
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ToolCallStatus;
    use crate::tools::EchoTool;
    use async_trait::async_trait;

    /// 主后端总是失败，回退后端可配置是否成功
    struct FlakyLookup {
        fallback_ok: Option<bool>,
    }

    #[async_trait]
    impl Tool for FlakyLookup {
        fn name(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "primary always fails"
        }

        fn has_fallback(&self) -> bool {
            self.fallback_ok.is_some()
        }

        async fn invoke(&self, backend: Backend, _args: &Value) -> Result<Value, String> {
            match (backend, self.fallback_ok) {
                (Backend::Fallback, Some(true)) => Ok(Value::String("from fallback".into())),
                (Backend::Fallback, _) => Err("fallback down".into()),
                (Backend::Primary, _) => Err("primary down".into()),
            }
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn invoke(&self, _backend: Backend, args: &Value) -> Result<Value, String> {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Value::String(format!("slept {ms}")))
        }
    }

    fn dispatcher(tools: Vec<Arc<dyn Tool>>, timeout_secs: u64) -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        for t in tools {
            registry.register_arc(t);
        }
        ToolDispatcher::new(registry, timeout_secs, 40, 4)
    }

    #[tokio::test]
    async fn test_unknown_tool_is_recorded_not_raised() {
        let d = dispatcher(vec![], 5);
        let record = d.invoke("nope", serde_json::json!({"q": 1})).await;
        assert_eq!(record.status, ToolCallStatus::Failure);
        assert_eq!(record.error, Some(ToolFailure::UnknownTool));
        assert_eq!(record.backend, None);
        assert_eq!(record.args["q"], 1);
    }

    #[tokio::test]
    async fn test_success_is_summarized() {
        let d = dispatcher(vec![], 5);
        let long = "word ".repeat(50);
        let record = d.invoke("echo", serde_json::json!({ "text": long })).await;
        assert!(record.is_success());
        assert_eq!(record.backend, Some(Backend::Primary));
        assert_eq!(record.result_summary.chars().count(), 40);
        assert!(record.result_summary.ends_with("..."));
    }

    #[tokio::test]
    async fn test_fallback_switch_is_recorded() {
        let d = dispatcher(
            vec![Arc::new(FlakyLookup {
                fallback_ok: Some(true),
            })],
            5,
        );
        let record = d.invoke("flaky", Value::Null).await;
        assert!(record.is_success());
        assert_eq!(record.backend, Some(Backend::Fallback));
        assert_eq!(record.result_summary, "from fallback");
    }

    #[tokio::test]
    async fn test_both_backends_failing() {
        let d = dispatcher(
            vec![Arc::new(FlakyLookup {
                fallback_ok: Some(false),
            })],
            5,
        );
        let record = d.invoke("flaky", Value::Null).await;
        assert_eq!(record.status, ToolCallStatus::Failure);
        assert_eq!(record.backend, Some(Backend::Fallback));
        match record.error {
            Some(ToolFailure::Handler { detail }) => {
                assert!(detail.contains("primary down"));
                assert!(detail.contains("fallback down"));
            }
            other => panic!("Expected Handler failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_fallback_stays_on_primary() {
        let d = dispatcher(vec![Arc::new(FlakyLookup { fallback_ok: None })], 5);
        let record = d.invoke("flaky", Value::Null).await;
        assert_eq!(record.backend, Some(Backend::Primary));
        assert_eq!(
            record.error,
            Some(ToolFailure::Handler {
                detail: "primary down".into()
            })
        );
    }

    #[tokio::test]
    async fn test_timeout_is_recorded() {
        let d = dispatcher(vec![Arc::new(SlowTool)], 1);
        let record = d.invoke("slow", serde_json::json!({"ms": 1500})).await;
        assert_eq!(record.error, Some(ToolFailure::Timeout { secs: 1 }));
    }

    #[tokio::test]
    async fn test_invoke_all_preserves_request_order() {
        let d = dispatcher(vec![Arc::new(SlowTool)], 5);
        let requests = vec![
            ToolRequest::new("slow", serde_json::json!({"ms": 150})),
            ToolRequest::new("missing", Value::Null),
            ToolRequest::new("slow", serde_json::json!({"ms": 10})),
            ToolRequest::new("echo", serde_json::json!({"text": "hi"})),
        ];
        let records = d.invoke_all(&requests).await;
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["slow", "missing", "slow", "echo"]);
        assert_eq!(records[0].result_summary, "slept 150");
        assert_eq!(records[2].result_summary, "slept 10");
        assert_eq!(records[3].result_summary, "hi");
    }

    #[test]
    fn test_summarize() {
        assert_eq!(summarize("  a \n b  ", 10), "a b");
        assert_eq!(summarize("abcdefghij", 6), "abc...");
        assert_eq!(summarize("", 6), "");
    }
}
