use std::sync::Arc;
use std::time::Instant;

use relay_types::ErrorCode;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    hash_value, timestamp, CallStatus, LedgerEntry, ProviderRequestRecord, TelemetrySink,
    ToolCallRecord, UsageRecord,
};

/// How a tool call settled.
#[derive(Clone, Debug)]
pub enum Outcome {
    Success(Value),
    Cached(Value),
    Failed { code: ErrorCode, message: String },
}

/// In-flight tool call, closed by [`Telemetry::tool_finish`].
#[derive(Debug)]
pub struct ToolSpan {
    pub call_id: Uuid,
    pub request_id: String,
    pub tool: String,
    args: Value,
    args_hash: String,
    started: Instant,
}

impl ToolSpan {
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Fire-and-forget recorder. A sink failure is logged and never reaches the caller.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    pub fn tool_start(&self, request_id: &str, tool: &str, args: &Value) -> ToolSpan {
        let span = ToolSpan {
            call_id: Uuid::new_v4(),
            request_id: request_id.to_string(),
            tool: tool.to_string(),
            args: args.clone(),
            args_hash: hash_value(args),
            started: Instant::now(),
        };
        debug!(request_id, tool, call_id = %span.call_id, "tool call started");
        span
    }

    /// Record the settled call and its usage line. Returns the latency written.
    pub fn tool_finish(&self, span: ToolSpan, outcome: Outcome) -> u64 {
        let latency_ms = span.elapsed_ms();
        let (status, error_code, error, result) = match outcome {
            Outcome::Success(v) => (CallStatus::Success, None, None, Some(v)),
            Outcome::Cached(v) => (CallStatus::Cached, None, None, Some(v)),
            Outcome::Failed { code, message } => (CallStatus::Error, Some(code), Some(message), None),
        };
        let ts = timestamp();
        let usage = UsageRecord {
            request_id: span.request_id.clone(),
            tool: span.tool.clone(),
            success: status != CallStatus::Error,
            cached: status == CallStatus::Cached,
            latency_ms,
            timestamp: ts.clone(),
        };
        self.write(LedgerEntry::ToolCall(ToolCallRecord {
            call_id: span.call_id,
            request_id: span.request_id,
            tool: span.tool,
            status,
            latency_ms,
            error_code,
            error,
            args_hash: span.args_hash,
            payload: span.args,
            result,
            timestamp: ts,
        }));
        self.write(LedgerEntry::Usage(usage));
        latency_ms
    }

    pub fn provider_request(
        &self,
        request_id: &str,
        provider: &str,
        tool: &str,
        latency_ms: u64,
        error: Option<String>,
    ) {
        let status = if error.is_some() {
            CallStatus::Error
        } else {
            CallStatus::Success
        };
        self.write(LedgerEntry::ProviderRequest(ProviderRequestRecord {
            request_id: request_id.to_string(),
            provider: provider.to_string(),
            tool: tool.to_string(),
            status,
            latency_ms,
            error,
            timestamp: timestamp(),
        }));
    }

    fn write(&self, entry: LedgerEntry) {
        if let Err(e) = self.sink.record(&entry) {
            warn!(request_id = entry.request_id(), error = %e, "telemetry write dropped");
        }
    }
}
