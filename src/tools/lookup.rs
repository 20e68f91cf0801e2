//! HTTP 检索工具：主端点 + 可选回退端点
//!
//! 由配置 [[tools.lookups]] 构造；标量参数作为 GET 查询参数发送。
//! JSON 响应原样解析，HTML 响应用 html2text 提取可读文本，其余按纯文本处理；
//! 响应超过 max_body_chars 时截断。回退端点返回的 JSON 对象会带上 `_source: "fallback"`。

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use serde_json::{Map, Value};

use crate::config::LookupSection;
use crate::history::Backend;
use crate::tools::Tool;

pub struct HttpLookupTool {
    client: Client,
    name: String,
    description: String,
    primary_url: String,
    fallback_url: Option<String>,
    required: Vec<String>,
    optional: Vec<String>,
    max_body_chars: usize,
}

/// 判断内容是否像 HTML（需提取可读文本）
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.starts_with("<html")
        || s.starts_with("<HTML")
        || (s.len() > 20 && s.contains('<') && (s.contains("</") || s.contains("<head")))
}

/// 只把标量参数转成查询串；对象/数组忽略
fn query_pairs(args: &Value) -> Vec<(String, String)> {
    let Some(obj) = args.as_object() else {
        return Vec::new();
    };
    let mut pairs: Vec<(String, String)> = obj
        .iter()
        .filter_map(|(k, v)| match v {
            Value::String(s) => Some((k.clone(), s.clone())),
            Value::Number(n) => Some((k.clone(), n.to_string())),
            Value::Bool(b) => Some((k.clone(), b.to_string())),
            _ => None,
        })
        .collect();
    pairs.sort();
    pairs
}

impl HttpLookupTool {
    pub fn from_section(section: &LookupSection, timeout_secs: u64, max_body_chars: usize) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .user_agent(concat!("folio/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        let description = if section.description.is_empty() {
            format!("HTTP lookup '{}'", section.name)
        } else {
            section.description.clone()
        };
        Self {
            client,
            name: section.name.clone(),
            description,
            primary_url: section.primary_url.clone(),
            fallback_url: section.fallback_url.clone(),
            required: section.required.clone(),
            optional: section.optional.clone(),
            max_body_chars,
        }
    }

    fn check_required(&self, args: &Value) -> Result<(), String> {
        for key in &self.required {
            let present = args
                .get(key)
                .map(|v| !v.is_null() && v.as_str().map_or(true, |s| !s.trim().is_empty()))
                .unwrap_or(false);
            if !present {
                return Err(format!("Missing required argument: {key}"));
            }
        }
        Ok(())
    }

    fn truncate(&self, body: String) -> String {
        if body.chars().count() > self.max_body_chars {
            body.chars().take(self.max_body_chars).collect::<String>() + "\n...[truncated]"
        } else {
            body
        }
    }

    async fn fetch(&self, url: &str, args: &Value) -> Result<Value, String> {
        let resp = self
            .client
            .get(url)
            .query(&query_pairs(args))
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let is_json = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);
        let mut body = resp
            .text()
            .await
            .map_err(|e| format!("Read body: {}", e))?;
        if body.starts_with('\u{FEFF}') {
            body = body['\u{FEFF}'.len_utf8()..].to_string();
        }

        if is_json {
            if let Ok(value) = serde_json::from_str::<Value>(&body) {
                return Ok(value);
            }
        }
        let text = if looks_like_html(&body) {
            match from_read(body.as_bytes(), 120) {
                Ok(text) if !text.trim().is_empty() => text,
                _ => body,
            }
        } else {
            body
        };
        Ok(Value::String(self.truncate(text)))
    }
}

#[async_trait]
impl Tool for HttpLookupTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        for key in self.required.iter().chain(self.optional.iter()) {
            properties.insert(key.clone(), serde_json::json!({ "type": "string" }));
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
        })
    }

    fn has_fallback(&self) -> bool {
        self.fallback_url.is_some()
    }

    async fn invoke(&self, backend: Backend, args: &Value) -> Result<Value, String> {
        self.check_required(args)?;
        let url = match backend {
            Backend::Primary => self.primary_url.as_str(),
            Backend::Fallback => self
                .fallback_url
                .as_deref()
                .ok_or_else(|| "No fallback endpoint configured".to_string())?,
        };
        tracing::debug!(tool = %self.name, url = %url, backend = %backend, "lookup fetch");
        let mut value = self.fetch(url, args).await?;
        if backend == Backend::Fallback {
            if let Value::Object(ref mut obj) = value {
                obj.insert("_source".to_string(), Value::String("fallback".into()));
            }
        }
        Ok(value)
    }
}
