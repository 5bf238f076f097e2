//! Typed wire protocol.
//!
//! Every SSE `data:` line carries one JSON object with a `type` discriminant.
//! Unrecognized discriminants deserialize to [`WireEvent::Unknown`] so new
//! server event kinds never break older clients.

use serde::Deserialize;

use crate::tool_calls::ToolCallFragment;

/// One decoded server event.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Start(StartEvent),
    Delta(DeltaEvent),
    ToolExecution(ToolExecutionEvent),
    ToolResult(ToolResultEvent),
    AssistantRoundComplete(RoundCompleteEvent),
    Done(DoneEvent),
    Error(ErrorEvent),
    /// Any event type this version does not know about.
    #[serde(other)]
    Unknown,
}

impl WireEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Delta(_) => "delta",
            Self::ToolExecution(_) => "tool_execution",
            Self::ToolResult(_) => "tool_result",
            Self::AssistantRoundComplete(_) => "assistant_round_complete",
            Self::Done(_) => "done",
            Self::Error(_) => "error",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartEvent {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub model: Option<ModelSelection>,
}

/// Model-selection metadata announced on `start`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSelection {
    #[serde(default)]
    pub original: Option<String>,
    #[serde(default)]
    pub current: Option<String>,
    #[serde(default)]
    pub was_overridden: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct DeltaEvent {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionEvent {
    #[serde(default)]
    pub tool_count: Option<usize>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEvent {
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub success: Option<bool>,
    /// Set when the tool ran server-side through MCP.
    #[serde(default)]
    pub is_mcp: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// End of an assistant round, optionally carrying the whole tool-call batch
/// of that round.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundCompleteEvent {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "tool_calls")]
    pub tool_calls: Option<Vec<ToolCallFragment>>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct DoneEvent {
    #[serde(default)]
    pub rounds: Option<u32>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub round_count: Option<u32>,
    #[serde(default)]
    pub recoverable: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub error_code: Option<String>,
}
