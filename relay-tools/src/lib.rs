//! Tool boundary: the trait the kernel invokes, a registry, and the built-in tools.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use relay_context::Message;
use relay_types::ToolError;
use serde_json::{json, Value};

pub mod http;
pub use http::{HttpTool, HttpToolConfig};

/// Per-attempt invocation context.
#[derive(Clone, Debug, Default)]
pub struct ToolContext {
    pub request_id: String,
    /// 1-based attempt number within the retry loop.
    pub attempt: u32,
    /// Messages of the request's conversation thread, if it named one.
    pub thread: Vec<Arc<Message>>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Breaker key. Tools fronting the same dependency should share one.
    fn service(&self) -> &str {
        self.name()
    }

    /// External provider behind this tool, if any. Calls to such tools are
    /// also recorded as provider requests.
    fn provider(&self) -> Option<&str> {
        None
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ToolError>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tool`, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Returns its arguments.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ToolError> {
        Ok(json!({
            "echo": args,
            "context_messages": ctx.thread.len(),
        }))
    }
}

/// Fails transiently for its first `failures` calls, then echoes.
pub struct FlakyTool {
    name: String,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyTool {
    pub fn new(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            return Err(ToolError::transient(format!("503 service unavailable (call {n})")));
        }
        Ok(json!({ "echo": args, "attempt": ctx.attempt }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::Classify;

    #[tokio::test]
    async fn registry_lookup() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));
        reg.register(Arc::new(FlakyTool::new("flaky", 1)));
        assert_eq!(reg.names(), vec!["echo", "flaky"]);
        assert!(reg.get("missing").is_none());

        let echo = reg.get("echo").unwrap();
        assert_eq!(echo.service(), "echo");
        assert!(echo.provider().is_none());
        let out = echo.invoke(&ToolContext::default(), &json!({"a": 1})).await.unwrap();
        assert_eq!(out["echo"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn flaky_recovers_after_failures() {
        let tool = FlakyTool::new("flaky", 2);
        let ctx = ToolContext::default();
        assert!(tool.invoke(&ctx, &json!({})).await.unwrap_err().is_transient());
        assert!(tool.invoke(&ctx, &json!({})).await.is_err());
        assert!(tool.invoke(&ctx, &json!({})).await.is_ok());
        assert_eq!(tool.calls(), 3);
    }
}
