//! Streaming ingestion for LLM generation endpoints.
//!
//! Turns a Server-Sent-Events byte stream into ordered text chunks, tool-call
//! notifications, tool results and a replayable timeline, then aggregates
//! everything into one [`StreamResult`].
//!
//! # Usage
//!
//! ```no_run
//! use orchestrator_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), OrchestratorError> {
//! let body = futures::stream::iter(vec![Ok::<_, std::io::Error>(
//!     b"data: {\"type\":\"delta\",\"content\":\"Hello\"}\n\n".to_vec(),
//! )]);
//!
//! let mut orchestrator = Orchestrator::with_config(OrchestratorConfig::from_env()?)?;
//! let mut events: Vec<StreamEvent> = Vec::new();
//! let result = orchestrator.process_stream(body, &mut events).await;
//!
//! assert_eq!(result.content, "Hello");
//! # Ok(())
//! # }
//! ```

/// Orchestrator options and environment loading.
pub mod config;
/// Public error types.
pub mod errors;
/// Typed output events and the observer adapter.
pub mod events;
/// Tracing subscriber setup.
pub mod observability;
/// Session state machine, abort handle and spawned sessions.
pub mod orchestrator;
/// Incremental SSE line decoding.
pub mod parser;
/// Common imports for typical usage.
pub mod prelude;
/// Recovery of tool calls embedded in text as XML-wrapped JSON.
pub mod recovery;
/// Aggregated session output.
pub mod result;
/// Ordered, round-scoped session record.
pub mod timeline;
/// Tool-call fragments, resolved calls and their accumulator.
pub mod tool_calls;
/// Wire protocol events.
pub mod wire;

pub use config::OrchestratorConfig;
pub use errors::{FailureKind, OrchestratorError, ParseError, StreamError};
pub use events::{SOURCE_ROUND_COMPLETE, SOURCE_STREAM, StreamEvent, StreamObserver};
pub use observability::{ObservabilityConfig, init_observability, init_observability_with};
pub use orchestrator::{AbortHandle, Orchestrator, SessionState, StreamHandle, spawn_stream};
pub use parser::{ChunkParser, DEFAULT_MAX_LINE_BYTES};
pub use recovery::{Extraction, MalformedToolCallRecovery};
pub use result::{StreamResult, ToolResult};
pub use timeline::{StreamTimeline, TimelineItem, TimelineRecorder, TimelineState};
pub use tool_calls::{FunctionCall, FunctionFragment, ToolCall, ToolCallAccumulator, ToolCallFragment};
pub use wire::{ModelSelection, WireEvent};
