use relay_types::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub mod idempotency;
pub mod sink;
pub mod telemetry;

pub use idempotency::{IdempotencyCache, IdempotencyRecord, DEFAULT_WINDOW};
pub use sink::{tail, JsonlSink, MemorySink, NullSink, TelemetrySink};
pub use telemetry::{Outcome, Telemetry, ToolSpan};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Cached,
    Error,
}

/// One tool invocation, written once when it settles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: Uuid,
    pub request_id: String,
    pub tool: String,
    pub status: CallStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub args_hash: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub timestamp: String,
}

/// Call made to an external provider on behalf of a tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequestRecord {
    pub request_id: String,
    pub provider: String,
    pub tool: String,
    pub status: CallStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

/// Flat analytics line, one per settled call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub tool: String,
    pub success: bool,
    pub cached: bool,
    pub latency_ms: u64,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    ToolCall(ToolCallRecord),
    ProviderRequest(ProviderRequestRecord),
    Usage(UsageRecord),
}

impl LedgerEntry {
    pub fn request_id(&self) -> &str {
        match self {
            LedgerEntry::ToolCall(r) => &r.request_id,
            LedgerEntry::ProviderRequest(r) => &r.request_id,
            LedgerEntry::Usage(r) => &r.request_id,
        }
    }
}

/// SHA-256 of the compact JSON encoding.
pub fn hash_value(value: &Value) -> String {
    let mut h = Sha256::new();
    h.update(value.to_string());
    hex::encode(h.finalize())
}

pub(crate) fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
