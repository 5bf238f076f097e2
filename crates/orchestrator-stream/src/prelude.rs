//! Common imports for typical orchestrator usage.
pub use crate::{
    AbortHandle, Orchestrator, OrchestratorConfig, OrchestratorError, StreamError, StreamEvent,
    StreamHandle, StreamObserver, StreamResult, ToolCall, spawn_stream,
};
