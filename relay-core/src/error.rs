use relay_context::ThreadError;
use relay_ledger::LedgerError;
use relay_queue::QueueError;
use relay_store::StoreError;
use relay_stream::TicketError;
use relay_types::{ErrorCode, ErrorKind, ToolError};
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("circuit open for {service}, retry in {retry_after_ms}ms")]
    CircuitOpen { service: String, retry_after_ms: u64 },
    #[error(transparent)]
    Tool(ToolError),
    #[error(transparent)]
    Ticket(#[from] TicketError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Thread(#[from] ThreadError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ToolError> for KernelError {
    fn from(e: ToolError) -> Self {
        match e.code {
            ErrorCode::InvalidInput => KernelError::InvalidInput(e.message),
            _ => KernelError::Tool(e),
        }
    }
}

impl KernelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            KernelError::InvalidInput(_) => ErrorCode::InvalidInput,
            KernelError::UnknownTool(_) => ErrorCode::UnknownTool,
            KernelError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            KernelError::Tool(e) => e.code,
            KernelError::Ticket(e) => e.code(),
            KernelError::Queue(QueueError::NotFound(_)) => ErrorCode::NotFound,
            KernelError::Queue(QueueError::NotProcessing { .. }) => ErrorCode::InvalidInput,
            KernelError::Thread(_) => ErrorCode::NotFound,
            KernelError::Queue(_)
            | KernelError::Store(_)
            | KernelError::Ledger(_)
            | KernelError::Config(_) => ErrorCode::Internal,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            KernelError::CircuitOpen { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Tool-level view of this error, as recorded on a failed job.
    pub fn into_tool_error(self) -> ToolError {
        match self {
            KernelError::Tool(e) => e,
            other => {
                let kind = match other {
                    KernelError::CircuitOpen { .. } | KernelError::Store(_) => ErrorKind::Transient,
                    _ => ErrorKind::Permanent,
                };
                ToolError {
                    kind,
                    code: other.code(),
                    message: other.to_string(),
                }
            }
        }
    }
}
