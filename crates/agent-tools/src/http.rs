//! HTTP Request Tool
//!
//! Calls external HTTP endpoints on behalf of a task. Targets are checked
//! against the URL guard before any connection is made, and redirects are
//! re-checked on every hop.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{redirect, Client, Method, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use agent_core::{tool::ParameterSchema, Result as CoreResult, Tool, ToolCall, ToolContext, ToolResult, ToolSchema};

use crate::error::{Result, ToolError};
use crate::url_guard::{is_blocked_url, is_valid_url};

pub const HTTP_TOOL_NAME: &str = "http_request";

const METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];
const MAX_REDIRECTS: usize = 5;
const ERROR_BODY_PREVIEW: usize = 500;

/// HTTP tool settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpToolConfig {
    pub timeout_ms: u64,
    /// Extra attempts after a network error or 5xx response
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_response_bytes: usize,
    pub user_agent: String,
    /// Permit loopback and private targets. Local test servers only.
    pub allow_private_networks: bool,
}

impl Default for HttpToolConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 2,
            retry_backoff_ms: 500,
            max_response_bytes: 5 * 1024 * 1024,
            user_agent: format!("agent-tools/{}", env!("CARGO_PKG_VERSION")),
            allow_private_networks: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HttpRequest {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: Map<String, Value>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    query: Map<String, Value>,
    #[serde(default = "default_response_type", alias = "responseType")]
    response_type: String,
    #[serde(default, alias = "timeout")]
    timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".into()
}

fn default_response_type() -> String {
    "json".into()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct HttpResponse {
    status: u16,
    headers: BTreeMap<String, String>,
    body: Value,
    url: String,
}

/// Tool for calling HTTP endpoints
pub struct HttpTool {
    client: Client,
    config: HttpToolConfig,
}

impl HttpTool {
    pub fn new() -> Result<Self> {
        Self::with_config(HttpToolConfig::default())
    }

    pub fn with_config(config: HttpToolConfig) -> Result<Self> {
        let allow_private = config.allow_private_networks;
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if !allow_private && is_blocked_url(attempt.url().as_str()) {
                attempt.error("redirect to an internal URL")
            } else {
                attempt.follow()
            }
        });

        let mut builder = Client::builder().user_agent(&config.user_agent).redirect(policy);
        if allow_private {
            builder = builder.no_proxy();
        }
        let client = builder.build().map_err(|e| ToolError::Network(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpToolConfig {
        &self.config
    }

    fn check_target(&self, url: &str) -> Result<()> {
        if !is_valid_url(url) {
            return Err(ToolError::InvalidUrl(url.to_string()));
        }
        if !self.config.allow_private_networks && is_blocked_url(url) {
            return Err(ToolError::BlockedUrl(url.to_string()));
        }
        Ok(())
    }

    async fn send_once(&self, method: &Method, req: &HttpRequest, timeout_ms: u64) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(method.clone(), &req.url)
            .timeout(Duration::from_millis(timeout_ms));

        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value_to_string(value));
        }
        if !req.query.is_empty() {
            let pairs: Vec<(&str, String)> = req.query.iter().map(|(k, v)| (k.as_str(), value_to_string(v))).collect();
            builder = builder.query(&pairs);
        }
        match &req.body {
            None | Some(Value::Null) => {}
            Some(Value::String(raw)) => builder = builder.body(raw.clone()),
            Some(other) => builder = builder.json(other),
        }

        let response = builder.send().await.map_err(|e| transport_error(&e, timeout_ms))?;
        self.read_response(response, &req.response_type, timeout_ms).await
    }

    async fn read_response(&self, mut response: Response, response_type: &str, timeout_ms: u64) -> Result<HttpResponse> {
        let status = response.status();
        let url = response.url().to_string();
        let headers = header_map(response.headers());
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let limit = self.config.max_response_bytes;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(ToolError::ResponseTooLarge(limit));
        }
        // Chunked bodies carry no length up front, so the cap is enforced while reading
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| transport_error(&e, timeout_ms))? {
            if bytes.len() + chunk.len() > limit {
                return Err(ToolError::ResponseTooLarge(limit));
            }
            bytes.extend_from_slice(&chunk);
        }
        let text = String::from_utf8_lossy(&bytes);

        if !status.is_success() {
            return Err(ToolError::Status {
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_PREVIEW).collect(),
                retry_after,
            });
        }

        let body = if response_type.eq_ignore_ascii_case("json") {
            if text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).map_err(|e| ToolError::InvalidResponse(e.to_string()))?
            }
        } else {
            serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.into_owned()))
        };

        Ok(HttpResponse {
            status: status.as_u16(),
            headers,
            body,
            url,
        })
    }

    /// Send with retry on network errors and 5xx responses
    async fn send(&self, method: &Method, req: &HttpRequest, timeout_ms: u64) -> (Result<HttpResponse>, u32) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(method, req, timeout_ms).await {
                Err(err) if err.is_retryable() && attempt <= self.config.max_retries => {
                    let backoff = self.config.retry_backoff_ms.saturating_mul(1 << (attempt - 1).min(10));
                    tracing::debug!(url = %req.url, attempt, backoff_ms = backoff, error = %err, "Retrying HTTP request");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                result => return (result, attempt),
            }
        }
    }

    async fn run(&self, call: &ToolCall) -> (Result<HttpResponse>, u32, String) {
        let req: HttpRequest = match serde_json::from_value(Value::Object(call.arguments.clone())) {
            Ok(req) => req,
            Err(e) => return (Err(ToolError::InvalidParams(e.to_string())), 0, String::new()),
        };
        let label = format!("{} {}", req.method.to_uppercase(), req.url);

        if let Err(err) = self.check_target(&req.url) {
            return (Err(err), 0, label);
        }
        let method_name = req.method.to_uppercase();
        if !METHODS.contains(&method_name.as_str()) {
            return (Err(ToolError::InvalidParams(format!("Unsupported method: {}", req.method))), 0, label);
        }
        let method = match Method::from_bytes(method_name.as_bytes()) {
            Ok(m) => m,
            Err(e) => return (Err(ToolError::InvalidParams(e.to_string())), 0, label),
        };

        let timeout_ms = req.timeout_ms.filter(|t| *t > 0).unwrap_or(self.config.timeout_ms);
        let (result, attempts) = self.send(&method, &req, timeout_ms).await;
        (result, attempts, label)
    }
}

fn transport_error(err: &reqwest::Error, timeout_ms: u64) -> ToolError {
    if err.is_timeout() {
        ToolError::Timeout(timeout_ms)
    } else {
        ToolError::Network(err.to_string())
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

/// Failure message; blocked targets keep the fixed wording callers match on
fn failure_message(err: &ToolError) -> String {
    match err {
        ToolError::BlockedUrl(_) => "Access to internal URLs is not allowed".to_string(),
        ToolError::Status {
            retry_after: Some(secs),
            ..
        } => format!("{err} (retry after {secs} seconds)"),
        other => other.to_string(),
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: HTTP_TOOL_NAME.into(),
            description: "Make an HTTP request to an external URL. Internal and private network addresses are blocked."
                .into(),
            parameters: vec![
                ParameterSchema::optional("method", "string", "HTTP method")
                    .with_enum(METHODS)
                    .with_default(json!("GET")),
                ParameterSchema::required("url", "string", "Absolute http(s) URL"),
                ParameterSchema::optional("headers", "object", "Request headers"),
                ParameterSchema::optional("body", "object", "JSON body, or a string sent as-is"),
                ParameterSchema::optional("query", "object", "Query string parameters"),
                ParameterSchema::optional("response_type", "string", "How to read the response body")
                    .with_enum(&["json", "text"])
                    .with_default(json!("json")),
                ParameterSchema::optional("timeout_ms", "number", "Request timeout in milliseconds"),
            ],
            category: Some("network".into()),
            has_side_effects: true,
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> CoreResult<ToolResult> {
        let started = Instant::now();
        let input = Value::Object(call.arguments.clone());
        let (result, attempts, label) = self.run(call).await;

        let tool_result = match result {
            Ok(response) => {
                tracing::info!(request = %label, status = response.status, attempts, "HTTP request completed");
                ToolResult::success(HTTP_TOOL_NAME, format!("{label} -> {}", response.status)).with_data(json!({
                    "status": response.status,
                    "headers": response.headers,
                    "body": response.body,
                    "url": response.url,
                    "attempts": attempts,
                }))
            }
            Err(err) => {
                tracing::warn!(request = %label, attempts, error = %err, "HTTP request failed");
                let mut data = json!({ "error_type": err.kind(), "attempts": attempts });
                if let ToolError::Status { status, .. } = &err {
                    data["status"] = json!(status);
                }
                ToolResult::failure(HTTP_TOOL_NAME, failure_message(&err)).with_data(data)
            }
        };

        ctx.log(HTTP_TOOL_NAME, &input, &tool_result.to_value(), started.elapsed(), tool_result.success);
        Ok(tool_result)
    }
}
