use std::fmt;

/// Which side of the pipeline produced a fatal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The byte reader failed or the HTTP exchange was rejected.
    Transport,
    /// The server reported an in-band `error` event.
    Protocol,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => f.write_str("transport"),
            Self::Protocol => f.write_str("protocol"),
        }
    }
}

/// Terminal session failure surfaced through `StreamEvent::Error` and kept in
/// `StreamResult::error`.
///
/// Provider context fields are only populated when the server sent them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[error("{kind} failure: {message}")]
#[serde(rename_all = "camelCase")]
pub struct StreamError {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_count: Option<u32>,
    /// Hint for the caller; this crate never retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
    /// Milliseconds since the Unix epoch, as sent by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl StreamError {
    /// Creates a transport failure with the generic `stream_error` code.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            message: message.into(),
            provider: None,
            model: None,
            status_code: None,
            round_count: None,
            recoverable: None,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
            error_code: Some("stream_error".to_string()),
        }
    }

    /// Creates a protocol failure with no provider context.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Protocol,
            message: message.into(),
            provider: None,
            model: None,
            status_code: None,
            round_count: None,
            recoverable: None,
            timestamp: None,
            error_code: None,
        }
    }

    /// Attaches an HTTP status code.
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

/// Non-fatal parse failures. These are logged and recovered locally; they
/// never reach the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// One SSE data line was not a valid event.
    #[error("malformed event line: {reason}")]
    MalformedEvent { reason: String },
    /// A single pending line grew past the configured bound.
    #[error("event line exceeds {limit} bytes ({len} buffered)")]
    LineTooLong { len: usize, limit: usize },
    /// An XML-wrapped tool-call block could not be used.
    #[error("malformed tool call block: {reason}")]
    MalformedToolCall { reason: String },
}

impl ParseError {
    pub(crate) fn malformed_event(reason: impl fmt::Display) -> Self {
        Self::MalformedEvent {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn malformed_tool_call(reason: impl fmt::Display) -> Self {
        Self::MalformedToolCall {
            reason: reason.to_string(),
        }
    }
}

/// Top-level error type for the public orchestrator API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    /// Invalid orchestrator configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Transport failure outside a running session (for example building a
    /// request).
    #[error("transport error: {0}")]
    Transport(String),
    /// A spawned session ended without handing back its result.
    #[error("protocol error: {0}")]
    Protocol(String),
}
