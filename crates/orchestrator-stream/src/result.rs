use serde::{Deserialize, Serialize};

use crate::errors::StreamError;
use crate::timeline::StreamTimeline;
use crate::tool_calls::ToolCall;

/// Outcome of one executed tool, as reported by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    /// The result verbatim when it was a JSON string, its serialization
    /// otherwise.
    pub content: String,
    pub success: bool,
}

impl ToolResult {
    pub(crate) fn content_from(result: Option<&serde_json::Value>) -> String {
        match result {
            Some(serde_json::Value::String(text)) => text.clone(),
            Some(serde_json::Value::Null) | None => "{}".to_string(),
            Some(other) => other.to_string(),
        }
    }
}

/// Final aggregated output of one streaming session.
///
/// Built exactly once per session; partial sessions still produce one, with
/// `success == false` and `error` set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResult {
    pub session_id: uuid::Uuid,
    pub success: bool,
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub timeline: StreamTimeline,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamError>,
}
