use std::time::{Duration, Instant};

use async_trait::async_trait;
use relay_types::{ToolError, TransientMatcher};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::{Tool, ToolContext};

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpToolConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Tool that POSTs its arguments as JSON to a remote endpoint.
///
/// Request body: `{"request_id", "attempt", "args", "context": [messages]}`.
/// A JSON response body is returned as-is; anything else is wrapped as
/// `{"text": ...}`.
pub struct HttpTool {
    config: HttpToolConfig,
    client: reqwest::Client,
    matcher: TransientMatcher,
}

impl HttpTool {
    pub fn new(config: HttpToolConfig, matcher: TransientMatcher) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ToolError::permanent(format!("http client: {e}")))?;
        Ok(Self {
            config,
            client,
            matcher,
        })
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn service(&self) -> &str {
        self.config.service.as_deref().unwrap_or(&self.config.name)
    }

    fn provider(&self) -> Option<&str> {
        self.config.provider.as_deref()
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ToolError> {
        let body = json!({
            "request_id": ctx.request_id,
            "attempt": ctx.attempt,
            "args": args,
            "context": ctx.thread,
        });
        let started = Instant::now();
        let resp = self
            .client
            .post(&self.config.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e, &self.matcher))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| classify_transport(&e, &self.matcher))?;
        debug!(
            tool = %self.config.name,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "http tool responded"
        );

        if !(200..300).contains(&status) {
            return Err(classify_status(status, &text, &self.matcher));
        }
        Ok(serde_json::from_str(&text).unwrap_or_else(|_| json!({ "text": text })))
    }
}

/// Error for a non-2xx response. 408, 429 and 5xx are transient; other
/// statuses are permanent unless the body matches a transient pattern.
pub fn classify_status(status: u16, body: &str, matcher: &TransientMatcher) -> ToolError {
    let message = format!("upstream returned {status}: {}", snippet(body));
    if status == 408 || status == 429 || status >= 500 {
        ToolError::transient(message)
    } else {
        ToolError::from_message(message, matcher)
    }
}

fn classify_transport(err: &reqwest::Error, matcher: &TransientMatcher) -> ToolError {
    if err.is_timeout() || err.is_connect() {
        ToolError::transient(format!("upstream unreachable: {err}"))
    } else {
        ToolError::from_message(format!("upstream request failed: {err}"), matcher)
    }
}

fn snippet(body: &str) -> &str {
    const MAX: usize = 200;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
