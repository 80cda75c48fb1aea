use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether retrying the same input can ever help.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Permanent,
    Transient,
}

/// Implemented by every error the retry and breaker layers wrap.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Stable machine-readable failure codes shared by the JSON envelope and the SSE `error` event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidInput,
    UnknownTool,
    NotFound,
    TicketNotFound,
    TicketUsed,
    TicketExpired,
    CircuitOpen,
    ToolFailed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::UnknownTool => "unknown_tool",
            ErrorCode::NotFound => "not_found",
            ErrorCode::TicketNotFound => "ticket_not_found",
            ErrorCode::TicketUsed => "ticket_used",
            ErrorCode::TicketExpired => "ticket_expired",
            ErrorCode::CircuitOpen => "circuit_open",
            ErrorCode::ToolFailed => "tool_failed",
            ErrorCode::Internal => "internal",
        }
    }

    /// HTTP-style status for the envelope.
    pub fn status(&self) -> u16 {
        match self {
            ErrorCode::InvalidInput => 400,
            ErrorCode::UnknownTool | ErrorCode::NotFound | ErrorCode::TicketNotFound => 404,
            ErrorCode::TicketUsed => 403,
            ErrorCode::TicketExpired => 410,
            ErrorCode::CircuitOpen => 429,
            ErrorCode::ToolFailed | ErrorCode::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a tool invocation, tagged with its retry class.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,
}

impl ToolError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            code: ErrorCode::ToolFailed,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            code: ErrorCode::ToolFailed,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            code: ErrorCode::InvalidInput,
            message: message.into(),
        }
    }

    /// Wraps an untyped upstream message, classifying it by substring.
    pub fn from_message(message: impl Into<String>, matcher: &TransientMatcher) -> Self {
        let message = message.into();
        if matcher.is_transient(&message) {
            Self::transient(message)
        } else {
            Self::permanent(message)
        }
    }
}

impl Classify for ToolError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Substring rules for errors that arrive as free text only.
///
/// Matching is case-insensitive. The pattern list is product policy and is
/// configurable; callers with structured errors should tag `ErrorKind` directly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransientMatcher {
    patterns: Vec<String>,
}

pub const DEFAULT_TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "too many requests",
    "503",
    "502",
    "504",
    "service unavailable",
    "temporarily unavailable",
];

impl TransientMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.into().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_transient(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.patterns.iter().any(|p| lower.contains(p.as_str()))
    }

    pub fn classify(&self, message: &str) -> ErrorKind {
        if self.is_transient(message) {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }
}

impl Default for TransientMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSIENT_PATTERNS.iter().copied())
    }
}
