use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod clock;
pub mod error;
pub mod job;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Classify, ErrorCode, ErrorKind, ToolError, TransientMatcher};
pub use job::{Job, JobStatus};

/// Breaker state for one named service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool invocation envelope as received from the routing layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub stream: bool,
    /// Conversation thread whose messages are handed to the tool as context.
    #[serde(default)]
    pub thread_id: Option<String>,
}

impl ToolRequest {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
            ..Default::default()
        }
    }

    /// Rejects requests the kernel can never execute, whatever the tool.
    pub fn validate(&self) -> Result<(), ToolError> {
        if self.tool.trim().is_empty() {
            return Err(ToolError::invalid_input("tool name is required"));
        }
        if !(self.args.is_object() || self.args.is_null()) {
            return Err(ToolError::invalid_input("args must be a JSON object"));
        }
        Ok(())
    }
}

/// One-time capability to open an event stream for a deferred tool call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamTicket {
    pub ticket: String,
    pub tool_name: String,
    pub arguments: Value,
    pub request_id: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Epoch milliseconds.
    pub created_at: u64,
    pub expires_at: u64,
    #[serde(default)]
    pub used_at: Option<u64>,
}

impl StreamTicket {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
