use tokio::sync::mpsc;

use crate::errors::StreamError;
use crate::result::StreamResult;
use crate::tool_calls::ToolCall;
use crate::wire::ModelSelection;

/// Where a `ToolCalls` notification came from.
pub const SOURCE_STREAM: &str = "stream";
pub const SOURCE_ROUND_COMPLETE: &str = "round_complete";

/// Typed output of the orchestrator, in emission order.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// First event of every session.
    StreamStarted,
    /// Model-selection metadata from the `start` event.
    ModelInfo(ModelSelection),
    /// Append-only text output.
    Chunk(String),
    /// Calls that became visible (display track).
    ToolCalls {
        calls: Vec<ToolCall>,
        source: &'static str,
    },
    /// Calls announced for execution (execution track).
    ToolExecution { count: usize, calls: Vec<ToolCall> },
    ToolResult {
        name: String,
        result: serde_json::Value,
        success: bool,
        call_id: Option<String>,
    },
    /// Reader reached its end without a fatal failure.
    StreamEnded,
    /// Terminal success event carrying the aggregated result.
    Completed(Box<StreamResult>),
    /// Terminal failure; emitted at most once per session.
    Error(StreamError),
}

/// Callback-style adapter over [`StreamEvent`].
///
/// Implement only the hooks you need; `on_event` dispatches to them.
pub trait StreamObserver {
    fn on_stream_start(&mut self) {}
    fn on_stream_chunk(&mut self, _text: &str) {}
    fn on_stream_end(&mut self) {}
    fn on_tool_calls(&mut self, _calls: &[ToolCall], _source: &str) {}
    fn on_tool_execution(&mut self, _count: usize, _calls: &[ToolCall]) {}
    fn on_tool_result(
        &mut self,
        _name: &str,
        _result: &serde_json::Value,
        _success: bool,
        _call_id: Option<&str>,
    ) {
    }
    fn on_complete(&mut self, _result: &StreamResult) {}
    fn on_error(&mut self, _error: &StreamError) {}
    fn on_model_info(&mut self, _model: &ModelSelection) {}

    fn on_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::StreamStarted => self.on_stream_start(),
            StreamEvent::ModelInfo(model) => self.on_model_info(model),
            StreamEvent::Chunk(text) => self.on_stream_chunk(text),
            StreamEvent::ToolCalls { calls, source } => self.on_tool_calls(calls, source),
            StreamEvent::ToolExecution { count, calls } => self.on_tool_execution(*count, calls),
            StreamEvent::ToolResult {
                name,
                result,
                success,
                call_id,
            } => self.on_tool_result(name, result, *success, call_id.as_deref()),
            StreamEvent::StreamEnded => self.on_stream_end(),
            StreamEvent::Completed(result) => self.on_complete(result),
            StreamEvent::Error(error) => self.on_error(error),
        }
    }
}

/// Collects every event; handy in tests and for batch replays.
impl StreamObserver for Vec<StreamEvent> {
    fn on_event(&mut self, event: &StreamEvent) {
        self.push(event.clone());
    }
}

/// Forwards events to a channel. A closed receiver is ignored; the session
/// still runs to completion.
impl StreamObserver for mpsc::UnboundedSender<StreamEvent> {
    fn on_event(&mut self, event: &StreamEvent) {
        let _ = self.send(event.clone());
    }
}

/// Discards every event.
impl StreamObserver for () {}
