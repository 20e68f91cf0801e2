//! HTTP 推理网关客户端
//!
//! JSON over HTTP：POST /v1/generate、POST /v1/batches、GET /v1/batches/{id}。
//! 408 / 429 / 5xx 与连接类错误视为 Transient，其余失败视为 Rejected。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::history::Context;
use crate::llm::{BatchHandle, BatchItem, BatchPoll, GatewayError, InferenceGateway, ModelReply};
use crate::tools::ToolSpec;

pub struct HttpGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct SubmitBody {
    id: String,
}

#[derive(Deserialize)]
struct PollBody {
    state: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    responses: HashMap<String, Value>,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn send_json(&self, req: reqwest::RequestBuilder) -> Result<Value, GatewayError> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| GatewayError::Rejected(format!("invalid JSON body: {e}")))
    }
}

fn classify_transport(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        GatewayError::Transient(e.to_string())
    } else {
        GatewayError::Rejected(e.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let preview: String = body.chars().take(200).collect();
    let msg = format!("HTTP {}: {}", status, preview);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        GatewayError::Transient(msg)
    } else {
        GatewayError::Rejected(msg)
    }
}

/// 批量结果中的单项：回复对象，或 {"error": "...", "retryable": bool}
fn parse_item(value: Value) -> Result<ModelReply, GatewayError> {
    if let Some(err) = value.get("error") {
        let msg = err
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        let retryable = value
            .get("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        return Err(if retryable {
            GatewayError::Transient(msg)
        } else {
            GatewayError::Rejected(msg)
        });
    }
    serde_json::from_value(value).map_err(|e| GatewayError::Rejected(format!("malformed reply: {e}")))
}

fn parse_poll(handle: &BatchHandle, body: PollBody) -> Result<BatchPoll, GatewayError> {
    match body.state.as_str() {
        "pending" | "queued" | "running" => Ok(BatchPoll::Pending),
        "succeeded" => Ok(BatchPoll::Completed(
            body.responses
                .into_iter()
                .map(|(alias, v)| (alias, parse_item(v)))
                .collect(),
        )),
        other => Err(GatewayError::Transient(format!(
            "batch {} ended in state {}{}",
            handle.id,
            other,
            body.error.map(|e| format!(": {e}")).unwrap_or_default()
        ))),
    }
}

#[async_trait]
impl InferenceGateway for HttpGateway {
    async fn call(&self, context: &Context, tools: &[ToolSpec]) -> Result<ModelReply, GatewayError> {
        let body = serde_json::json!({
            "context": context,
            "transcript": context.transcript(),
            "tools": tools,
        });
        let value = self
            .send_json(self.client.post(self.url("/v1/generate")).json(&body))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| GatewayError::Rejected(format!("malformed reply: {e}")))
    }

    async fn submit_batch(&self, items: Vec<BatchItem>) -> Result<BatchHandle, GatewayError> {
        let body = serde_json::json!({ "items": items });
        let value = self
            .send_json(self.client.post(self.url("/v1/batches")).json(&body))
            .await?;
        let parsed: SubmitBody = serde_json::from_value(value)
            .map_err(|e| GatewayError::Rejected(format!("malformed batch handle: {e}")))?;
        Ok(BatchHandle { id: parsed.id })
    }

    async fn poll_batch(&self, handle: &BatchHandle) -> Result<BatchPoll, GatewayError> {
        let value = self
            .send_json(self.client.get(self.url(&format!("/v1/batches/{}", handle.id))))
            .await?;
        let body: PollBody = serde_json::from_value(value)
            .map_err(|e| GatewayError::Rejected(format!("malformed batch status: {e}")))?;
        parse_poll(handle, body)
    }
}
