use std::collections::HashSet;
use std::fmt;

use futures::{Stream, StreamExt as _};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::config::OrchestratorConfig;
use crate::errors::{FailureKind, OrchestratorError, StreamError};
use crate::events::{SOURCE_ROUND_COMPLETE, SOURCE_STREAM, StreamEvent, StreamObserver};
use crate::parser::ChunkParser;
use crate::recovery::MalformedToolCallRecovery;
use crate::result::{StreamResult, ToolResult};
use crate::timeline::{TimelineRecorder, TimelineState};
use crate::tool_calls::{ToolCall, ToolCallAccumulator};
use crate::wire::{
    DeltaEvent, DoneEvent, ErrorEvent, RoundCompleteEvent, StartEvent, ToolExecutionEvent,
    ToolResultEvent, WireEvent,
};

/// Lifecycle of one orchestrator session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Handle used to stop reading a stream early.
///
/// Aborting is treated as a normal end of stream: the session still emits
/// `StreamEnded` and `Completed` with whatever was accumulated.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Requests cancellation.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Drives one SSE session: parses bytes, dispatches wire events to the tool
/// accumulator, XML recovery and timeline, and aggregates the final result.
///
/// The orchestrator is caller-owned and single-session. Call
/// [`reset`](Self::reset) before reusing it.
#[derive(Debug)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    parser: ChunkParser,
    tools: ToolCallAccumulator,
    recovery: MalformedToolCallRecovery,
    timeline: TimelineRecorder,
    content: String,
    reasoning: String,
    round_text: String,
    // Characters of `round_text` already emitted as chunks.
    round_emitted: usize,
    tool_results: Vec<ToolResult>,
    next_result_id: u64,
    state: SessionState,
    session_id: uuid::Uuid,
    error: Option<StreamError>,
    result: Option<StreamResult>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::build(OrchestratorConfig::default())
    }

    pub fn with_config(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: OrchestratorConfig) -> Self {
        Self {
            parser: ChunkParser::with_max_line_bytes(config.max_line_bytes),
            config,
            tools: ToolCallAccumulator::new(),
            recovery: MalformedToolCallRecovery::new(),
            timeline: TimelineRecorder::new(),
            content: String::new(),
            reasoning: String::new(),
            round_text: String::new(),
            round_emitted: 0,
            tool_results: Vec::new(),
            next_result_id: 0,
            state: SessionState::Idle,
            session_id: uuid::Uuid::new_v4(),
            error: None,
            result: None,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    /// Text emitted so far.
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timeline_state(&self) -> TimelineState {
        self.timeline.state()
    }

    /// Clears every accumulator and starts a new session id.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.tools.reset();
        self.recovery.reset();
        self.timeline.reset();
        self.content.clear();
        self.reasoning.clear();
        self.round_text.clear();
        self.round_emitted = 0;
        self.tool_results.clear();
        self.next_result_id = 0;
        self.state = SessionState::Idle;
        self.session_id = uuid::Uuid::new_v4();
        self.error = None;
        self.result = None;
    }

    /// Consumes one byte chunk and returns the events it produced.
    ///
    /// The first call of a session also yields `StreamStarted`. Chunks fed
    /// after the session ended are ignored.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.state.is_terminal() {
            warn!(session_id = %self.session_id, bytes = chunk.len(), "ignoring bytes after session end");
            return out;
        }
        self.begin(&mut out);
        for event in self.parser.parse(chunk) {
            self.dispatch(event, &mut out);
            if self.state == SessionState::Failed {
                break;
            }
        }
        out
    }

    /// Ends the session normally: flushes the parser, emits `StreamEnded` and
    /// `Completed`, and returns the result.
    ///
    /// A failed session returns its partial result without further events.
    /// Calling `finish` again returns the same result.
    pub fn finish(&mut self) -> (Vec<StreamEvent>, StreamResult) {
        let mut out = Vec::new();
        if let Some(result) = &self.result {
            return (out, result.clone());
        }
        self.begin(&mut out);
        if self.state == SessionState::Streaming {
            for event in self.parser.flush() {
                self.dispatch(event, &mut out);
                if self.state == SessionState::Failed {
                    break;
                }
            }
        }
        if self.state == SessionState::Streaming {
            self.state = SessionState::Completed;
            out.push(StreamEvent::StreamEnded);
            let result = self.conclude();
            let state = self.timeline.state();
            info!(
                session_id = %self.session_id,
                content_chars = result.content.chars().count(),
                tool_calls = result.tool_calls.len(),
                tool_results = result.tool_results.len(),
                timeline_items = state.item_count,
                rounds = state.round,
                elapsed_ms = state.elapsed_ms,
                "stream completed"
            );
            out.push(StreamEvent::Completed(Box::new(result.clone())));
            return (out, result);
        }
        (out, self.conclude())
    }

    /// Ends the session with a fatal failure and returns the partial result.
    ///
    /// `Error` is emitted at most once per session; failing an already
    /// failed or completed session only returns the existing result.
    pub fn fail(&mut self, err: StreamError) -> (Vec<StreamEvent>, StreamResult) {
        let mut out = Vec::new();
        if self.state.is_terminal() {
            return (out, self.conclude());
        }
        self.begin(&mut out);
        self.record_failure(err, &mut out);
        (out, self.conclude())
    }

    /// Runs a whole session over `reader`, reporting events to `observer`.
    ///
    /// A reader error becomes a transport failure; the reader ending is a
    /// normal end. An orchestrator that already ran a session is reset first.
    pub async fn process_stream<S, B, E, O>(&mut self, reader: S, observer: &mut O) -> StreamResult
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: fmt::Display,
        O: StreamObserver + ?Sized,
    {
        self.drive(reader, None, observer).await
    }

    /// Like [`process_stream`](Self::process_stream), stopping early when
    /// `abort` fires.
    pub async fn process_stream_abortable<S, B, E, O>(
        &mut self,
        reader: S,
        observer: &mut O,
        abort: &AbortHandle,
    ) -> StreamResult
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: fmt::Display,
        O: StreamObserver + ?Sized,
    {
        self.drive(reader, Some(abort.subscribe()), observer).await
    }

    /// Runs a session over an HTTP response body.
    ///
    /// A non-success status fails the session as a transport error carrying
    /// the status code and the response body.
    pub async fn process_response<O>(
        &mut self,
        response: reqwest::Response,
        observer: &mut O,
    ) -> StreamResult
    where
        O: StreamObserver + ?Sized,
    {
        let status = response.status();
        if !status.is_success() {
            self.prepare();
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(
                        session_id = %self.session_id,
                        status = status.as_u16(),
                        error = %e,
                        "could not read error response body"
                    );
                    String::new()
                }
            };
            let message = if body.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                format!("HTTP {status}: {}", body.trim())
            };
            let (events, result) =
                self.fail(StreamError::transport(message).with_status(status.as_u16()));
            for event in &events {
                observer.on_event(event);
            }
            return result;
        }
        self.process_stream(response.bytes_stream(), observer).await
    }

    /// Sends `request` and runs a session over its response.
    ///
    /// A request that cannot be built or sent never starts a session and is
    /// returned as [`OrchestratorError::Transport`].
    pub async fn process_request<O>(
        &mut self,
        request: reqwest::RequestBuilder,
        observer: &mut O,
    ) -> Result<StreamResult, OrchestratorError>
    where
        O: StreamObserver + ?Sized,
    {
        let response = request
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| OrchestratorError::Transport(format!("request failed: {e}")))?;
        Ok(self.process_response(response, observer).await)
    }

    async fn drive<S, B, E, O>(
        &mut self,
        reader: S,
        mut abort: Option<watch::Receiver<bool>>,
        observer: &mut O,
    ) -> StreamResult
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: fmt::Display,
        O: StreamObserver + ?Sized,
    {
        self.prepare();
        let mut reader = std::pin::pin!(reader);
        let mut events = Vec::new();
        self.begin(&mut events);
        loop {
            for event in events.drain(..) {
                observer.on_event(&event);
            }
            if self.state.is_terminal() {
                break;
            }
            events = self.advance(read_next(&mut reader, &mut abort).await);
        }
        self.conclude()
    }

    fn advance<B, E>(&mut self, read: Read<B, E>) -> Vec<StreamEvent>
    where
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        match read {
            Read::Chunk(bytes) => self.feed(bytes.as_ref()),
            Read::Failed(err) => self.fail(StreamError::transport(err.to_string())).0,
            Read::End => self.finish().0,
            Read::Aborted => {
                info!(session_id = %self.session_id, "stream aborted by caller");
                self.finish().0
            }
        }
    }

    fn prepare(&mut self) {
        if self.state != SessionState::Idle {
            warn!(
                session_id = %self.session_id,
                state = ?self.state,
                "orchestrator reused without reset; resetting"
            );
            self.reset();
        }
    }

    fn begin(&mut self, out: &mut Vec<StreamEvent>) {
        if self.state == SessionState::Idle {
            self.state = SessionState::Streaming;
            debug!(session_id = %self.session_id, xml_recovery = self.config.xml_recovery, "stream started");
            out.push(StreamEvent::StreamStarted);
        }
    }

    fn dispatch(&mut self, event: WireEvent, out: &mut Vec<StreamEvent>) {
        debug!(
            session_id = %self.session_id,
            kind = event.kind(),
            round = self.timeline.round(),
            "dispatching wire event"
        );
        match event {
            WireEvent::Start(start) => self.on_start(start, out),
            WireEvent::Delta(delta) => self.on_delta(delta, out),
            WireEvent::ToolExecution(execution) => self.on_tool_execution(execution, out),
            WireEvent::ToolResult(result) => self.on_tool_result(result, out),
            WireEvent::AssistantRoundComplete(round) => self.on_round_complete(round, out),
            WireEvent::Done(done) => self.on_done(done),
            WireEvent::Error(err) => self.on_error(err, out),
            WireEvent::Unknown => trace!(session_id = %self.session_id, "ignoring unknown event type"),
        }
    }

    fn on_start(&mut self, start: StartEvent, out: &mut Vec<StreamEvent>) {
        debug!(
            session_id = %self.session_id,
            server_session_id = start.session_id.as_deref().unwrap_or_default(),
            "server acknowledged stream"
        );
        if let Some(model) = start.model {
            if model.was_overridden {
                info!(
                    original = model.original.as_deref().unwrap_or_default(),
                    current = model.current.as_deref().unwrap_or_default(),
                    reasons = ?model.reasons,
                    "server overrode the requested model"
                );
            }
            out.push(StreamEvent::ModelInfo(model));
        }
    }

    fn on_delta(&mut self, delta: DeltaEvent, out: &mut Vec<StreamEvent>) {
        if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
            let visible = self.ingest_text(&text);
            if !visible.is_empty() {
                self.content.push_str(&visible);
                self.timeline.add_text(&visible);
                out.push(StreamEvent::Chunk(visible));
            }
        }
        if let Some(reasoning) = delta.reasoning {
            self.reasoning.push_str(&reasoning);
        }
        for fragment in delta.tool_calls.iter().flatten() {
            self.tools.add_fragment(fragment);
        }
    }

    /// Appends `text` to the round buffer and returns the part that should
    /// be emitted. Emitted output never shrinks: when a recovered block is
    /// removed, only characters past what was already emitted come out.
    fn ingest_text(&mut self, text: &str) -> String {
        self.round_text.push_str(text);
        if !self.config.xml_recovery || !MalformedToolCallRecovery::detect(&self.round_text) {
            self.round_emitted += text.chars().count();
            return text.to_string();
        }

        // Each pass strips one block, so the loop ends.
        while MalformedToolCallRecovery::detect(&self.round_text) {
            let extraction = self.recovery.extract(&self.round_text);
            for call in extraction.tool_calls {
                self.tools.add_complete(call);
            }
            self.round_text = extraction.clean_text;
        }
        let suffix: String = self.round_text.chars().skip(self.round_emitted).collect();
        self.round_emitted += suffix.chars().count();
        suffix
    }

    fn on_tool_execution(&mut self, execution: ToolExecutionEvent, out: &mut Vec<StreamEvent>) {
        debug!(
            session_id = %self.session_id,
            tool_count = execution.tool_count.unwrap_or_default(),
            "server executing tools"
        );
        let display = self.tools.pending_for_display();
        let execute = self.tools.pending_for_execution();
        self.announce(display, execute, execution.tool_count, SOURCE_STREAM, out);
        self.close_round();
    }

    fn on_round_complete(&mut self, round: RoundCompleteEvent, out: &mut Vec<StreamEvent>) {
        let mut seen = HashSet::new();
        let mut batch = Vec::new();
        for call in round.tool_calls.into_iter().flatten().filter_map(|f| f.into_call()) {
            if seen.insert(call.id.clone()) {
                self.tools.add_complete(call.clone());
                batch.push(call);
            }
        }
        // Resolve against the accumulator so streamed arguments win.
        let batch: Vec<ToolCall> = batch
            .into_iter()
            .map(|call| self.tools.get(&call.id).cloned().unwrap_or(call))
            .collect();
        debug!(
            session_id = %self.session_id,
            finish_reason = round.finish_reason.as_deref().unwrap_or_default(),
            batch = batch.len(),
            "assistant round complete"
        );

        let display = batch
            .iter()
            .filter(|call| !self.tools.is_displayed(&call.id))
            .cloned()
            .collect();
        let execute = batch
            .iter()
            .filter(|call| !self.tools.is_executed(&call.id))
            .cloned()
            .collect();
        self.announce(display, execute, None, SOURCE_ROUND_COMPLETE, out);
        self.close_round();
    }

    fn announce(
        &mut self,
        display: Vec<ToolCall>,
        execute: Vec<ToolCall>,
        tool_count: Option<usize>,
        source: &'static str,
        out: &mut Vec<StreamEvent>,
    ) {
        if !display.is_empty() {
            self.tools.mark_displayed(display.iter().map(|c| c.id.as_str()));
            out.push(StreamEvent::ToolCalls {
                calls: display,
                source,
            });
        }
        if !execute.is_empty() {
            self.tools.mark_executed(execute.iter().map(|c| c.id.as_str()));
            self.timeline.add_tool_execution(&execute, tool_count);
            let count = tool_count.filter(|n| *n > 0).unwrap_or(execute.len());
            out.push(StreamEvent::ToolExecution {
                count,
                calls: execute,
            });
        }
    }

    fn close_round(&mut self) {
        self.timeline.increment_round();
        self.tools.clear_round();
        self.round_text.clear();
        self.round_emitted = 0;
    }

    fn on_tool_result(&mut self, result: ToolResultEvent, out: &mut Vec<StreamEvent>) {
        let tool_call_id = match result.tool_call_id.clone().filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => {
                self.next_result_id += 1;
                format!("call_{}", self.next_result_id)
            }
        };
        let name = result
            .tool_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "unknown_tool".to_string());
        let success = result.success.unwrap_or(false);
        let value = result.result.unwrap_or(serde_json::Value::Null);
        debug!(
            session_id = %self.session_id,
            tool_call_id = %tool_call_id,
            tool = %name,
            success,
            is_mcp = result.is_mcp.unwrap_or(false),
            "tool result received"
        );

        self.tool_results.push(ToolResult {
            tool_call_id: tool_call_id.clone(),
            name: name.clone(),
            content: ToolResult::content_from(Some(&value)),
            success,
        });
        self.timeline
            .add_tool_result(tool_call_id, name.clone(), value.clone(), success);
        out.push(StreamEvent::ToolResult {
            name,
            result: value,
            success,
            call_id: result.tool_call_id,
        });
    }

    fn on_done(&mut self, done: DoneEvent) {
        let state = self.timeline.state();
        info!(
            session_id = %self.session_id,
            server_rounds = done.rounds.unwrap_or_default(),
            rounds = state.round,
            timeline_items = state.item_count,
            tool_calls = self.tools.len(),
            "server finished stream"
        );
    }

    fn on_error(&mut self, event: ErrorEvent, out: &mut Vec<StreamEvent>) {
        let err = StreamError {
            kind: FailureKind::Protocol,
            message: event
                .error
                .unwrap_or_else(|| "unknown stream error".to_string()),
            provider: event.provider,
            model: event.model,
            status_code: event.status_code,
            round_count: event.round_count,
            recoverable: event.recoverable,
            timestamp: event.timestamp,
            error_code: event.error_code,
        };
        self.record_failure(err, out);
    }

    fn record_failure(&mut self, err: StreamError, out: &mut Vec<StreamEvent>) {
        error!(
            session_id = %self.session_id,
            kind = %err.kind,
            provider = err.provider.as_deref().unwrap_or_default(),
            model = err.model.as_deref().unwrap_or_default(),
            status_code = err.status_code.unwrap_or_default(),
            error_code = err.error_code.as_deref().unwrap_or_default(),
            "stream failed: {}",
            err.message
        );
        self.state = SessionState::Failed;
        self.error = Some(err.clone());
        out.push(StreamEvent::Error(err));
    }

    fn conclude(&mut self) -> StreamResult {
        if let Some(result) = &self.result {
            return result.clone();
        }
        let mut timeline = self.timeline.timeline();
        timeline.completed_at = Some(chrono::Utc::now());
        let result = StreamResult {
            session_id: self.session_id,
            success: self.error.is_none(),
            content: self.content.clone(),
            reasoning: self.reasoning.clone(),
            tool_calls: self.tools.all(),
            tool_results: self.tool_results.clone(),
            timeline,
            error: self.error.clone(),
        };
        self.result = Some(result.clone());
        result
    }
}

enum Read<B, E> {
    Chunk(B),
    Failed(E),
    End,
    Aborted,
}

enum Wake<T> {
    Item(Option<T>),
    AbortChanged(bool),
}

async fn read_next<R, B, E>(reader: &mut R, abort: &mut Option<watch::Receiver<bool>>) -> Read<B, E>
where
    R: Stream<Item = Result<B, E>> + Unpin,
{
    loop {
        let wake = match abort.as_mut() {
            None => Wake::Item(reader.next().await),
            Some(rx) => {
                if *rx.borrow_and_update() {
                    return Read::Aborted;
                }
                tokio::select! {
                    changed = rx.changed() => Wake::AbortChanged(changed.is_ok()),
                    next = reader.next() => Wake::Item(next),
                }
            }
        };
        match wake {
            Wake::Item(Some(Ok(bytes))) => return Read::Chunk(bytes),
            Wake::Item(Some(Err(err))) => return Read::Failed(err),
            Wake::Item(None) => return Read::End,
            Wake::AbortChanged(true) => {}
            // Every abort handle is gone; keep reading unguarded.
            Wake::AbortChanged(false) => *abort = None,
        }
    }
}

/// Streaming handle returned by [`spawn_stream`].
///
/// Use `next_event()` to consume events as they arrive and `finish()` to
/// obtain the final result after the terminal event.
pub struct StreamHandle {
    session_id: uuid::Uuid,
    rx: mpsc::Receiver<StreamEvent>,
    final_rx: oneshot::Receiver<StreamResult>,
    abort_handle: AbortHandle,
    saw_terminal: bool,
}

impl StreamHandle {
    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    /// Returns a handle that stops the session early.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Waits for the next event. Returns `None` once the channel is closed.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        let event = self.rx.recv().await;
        if let Some(StreamEvent::Completed(_) | StreamEvent::Error(_)) = &event {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains remaining events (if needed) and returns the session result.
    pub async fn finish(mut self) -> Result<StreamResult, OrchestratorError> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(StreamEvent::Completed(_) | StreamEvent::Error(_)) => {
                    self.saw_terminal = true;
                }
                Some(_) => {}
                None => break,
            }
        }
        self.final_rx.await.map_err(|_| {
            OrchestratorError::Protocol(format!(
                "stream task ended without a result (session_id={})",
                self.session_id
            ))
        })
    }
}

/// Runs a session on a tokio task and returns a handle to its events.
///
/// Events go through a bounded channel of `event_buffer_capacity`; a slow
/// consumer applies backpressure to the reader. Dropping the handle stops
/// the session at its next event.
pub fn spawn_stream<S, B, E>(mut orchestrator: Orchestrator, reader: S) -> StreamHandle
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    orchestrator.prepare();
    let (tx, rx) = mpsc::channel(orchestrator.config.event_buffer_capacity);
    let (final_tx, final_rx) = oneshot::channel();
    let abort_handle = AbortHandle::new();
    let abort_rx = abort_handle.subscribe();
    let session_id = orchestrator.session_id;

    tokio::spawn(stream_task(orchestrator, reader, tx, final_tx, abort_rx));

    StreamHandle {
        session_id,
        rx,
        final_rx,
        abort_handle,
        saw_terminal: false,
    }
}

async fn stream_task<S, B, E>(
    mut orchestrator: Orchestrator,
    reader: S,
    tx: mpsc::Sender<StreamEvent>,
    final_tx: oneshot::Sender<StreamResult>,
    abort_rx: watch::Receiver<bool>,
) where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let mut reader = std::pin::pin!(reader);
    let mut abort = Some(abort_rx);
    let mut events = Vec::new();
    orchestrator.begin(&mut events);
    loop {
        for event in events.drain(..) {
            if tx.send(event).await.is_err() {
                debug!(session_id = %orchestrator.session_id, "event receiver dropped; stopping stream");
                let _ = final_tx.send(orchestrator.finish().1);
                return;
            }
        }
        if orchestrator.state.is_terminal() {
            break;
        }
        events = orchestrator.advance(read_next(&mut reader, &mut abort).await);
    }
    let _ = final_tx.send(orchestrator.conclude());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::timeline::TimelineItem;

    fn frame(value: serde_json::Value) -> String {
        format!("data: {value}\n\n")
    }

    fn delta(text: &str) -> String {
        frame(json!({"type": "delta", "content": text}))
    }

    fn chunks(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn reader(
        parts: Vec<String>,
    ) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Unpin {
        futures::stream::iter(parts.into_iter().map(|p| Ok(p.into_bytes())))
    }

    #[test]
    fn feed_emits_start_once_and_chunks_in_order() {
        let mut orch = Orchestrator::new();
        let mut events = orch.feed(delta("Hello").as_bytes());
        events.extend(orch.feed(delta(" world").as_bytes()));
        assert_eq!(events[0], StreamEvent::StreamStarted);
        assert_eq!(
            events.iter().filter(|e| **e == StreamEvent::StreamStarted).count(),
            1
        );
        assert_eq!(chunks(&events), "Hello world");
        assert_eq!(orch.state(), SessionState::Streaming);

        let (tail, result) = orch.finish();
        assert_eq!(tail[0], StreamEvent::StreamEnded);
        assert!(matches!(tail[1], StreamEvent::Completed(_)));
        assert!(result.success);
        assert_eq!(result.content, "Hello world");
        assert!(result.timeline.completed_at.is_some());
        assert_eq!(orch.state(), SessionState::Completed);
    }

    #[test]
    fn finish_flushes_a_last_line_without_newline() {
        let mut orch = Orchestrator::new();
        orch.feed(br#"data: {"type":"delta","content":"tail"}"#);
        let (events, result) = orch.finish();
        assert_eq!(chunks(&events), "tail");
        assert_eq!(result.content, "tail");
    }

    #[test]
    fn finish_twice_returns_the_same_result_without_events() {
        let mut orch = Orchestrator::new();
        let (_, first) = orch.finish();
        let (events, second) = orch.finish();
        assert!(events.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn in_band_error_stops_the_chunk_and_fails_once() {
        let mut orch = Orchestrator::new();
        let bytes = format!(
            "{}{}{}",
            delta("partial"),
            frame(json!({"type":"error","error":"boom","provider":"groq","statusCode":502,"recoverable":true})),
            delta("ignored")
        );
        let events = orch.feed(bytes.as_bytes());
        assert_eq!(chunks(&events), "partial");
        let errors: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Error(err) => Some(err),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, FailureKind::Protocol);
        assert_eq!(errors[0].message, "boom");
        assert_eq!(errors[0].provider.as_deref(), Some("groq"));
        assert_eq!(errors[0].status_code, Some(502));
        assert_eq!(errors[0].recoverable, Some(true));

        assert!(orch.feed(delta("late").as_bytes()).is_empty());
        let (tail, result) = orch.finish();
        assert!(tail.is_empty());
        assert!(!result.success);
        assert_eq!(result.content, "partial");
        assert_eq!(orch.state(), SessionState::Failed);
    }

    #[test]
    fn fail_emits_error_once() {
        let mut orch = Orchestrator::new();
        orch.feed(delta("x").as_bytes());
        let (events, result) = orch.fail(StreamError::transport("reset by peer"));
        assert_eq!(events.len(), 1);
        assert!(!result.success);
        let (again, _) = orch.fail(StreamError::transport("second"));
        assert!(again.is_empty());
        assert_eq!(
            orch.finish().1.error.map(|e| e.message),
            Some("reset by peer".to_string())
        );
    }

    #[test]
    fn model_info_is_surfaced_from_start() {
        let mut orch = Orchestrator::new();
        let events = orch.feed(
            frame(json!({
                "type": "start",
                "sessionId": "s1",
                "model": {"original": "a", "current": "b", "wasOverridden": true, "reasons": ["images"]}
            }))
            .as_bytes(),
        );
        let model = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ModelInfo(model) => Some(model),
                _ => None,
            })
            .expect("model info");
        assert_eq!(model.current.as_deref(), Some("b"));
        assert!(model.was_overridden);
    }

    #[test]
    fn xml_block_in_one_delta_is_recovered() {
        let mut orch = Orchestrator::new();
        let text = "Let me look. <tool_calls>[{\"type\":\"function\",\"function\":{\"name\":\"search\",\"arguments\":{\"q\":\"rust\"}}}]</tool_calls>";
        let events = orch.feed(delta(text).as_bytes());
        assert_eq!(chunks(&events), "Let me look.");

        let events = orch.feed(frame(json!({"type":"tool_execution","toolCount":1})).as_bytes());
        let executed = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ToolExecution { calls, .. } => Some(calls.clone()),
                _ => None,
            })
            .expect("execution");
        assert_eq!(executed[0].id, "xml_call_1");
        assert_eq!(executed[0].function.arguments, "{\"q\":\"rust\"}");
    }

    #[test]
    fn recovered_text_stays_append_only() {
        let mut orch = Orchestrator::new();
        let mut events = orch.feed(delta("Before").as_bytes());
        events.extend(orch.feed(
            delta(" <tool_calls>[{\"function\":{\"name\":\"f\"}}]</tool_calls> and after").as_bytes(),
        ));
        assert_eq!(chunks(&events), "Before and after");
        assert_eq!(orch.content(), "Before and after");
    }

    #[test]
    fn every_block_in_one_delta_is_recovered() {
        let mut orch = Orchestrator::new();
        let text = "a <tool_calls>[{\"function\":{\"name\":\"f\"}}]</tool_calls> b <tool_calls>[{\"function\":{\"name\":\"g\"}}]</tool_calls> c";
        let mut events = orch.feed(delta(text).as_bytes());
        events.extend(orch.feed(frame(json!({"type":"tool_execution","toolCount":2})).as_bytes()));
        assert_eq!(chunks(&events), "a b c");

        let executed: Vec<(String, String)> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolExecution { calls, .. } => Some(calls.clone()),
                _ => None,
            })
            .flatten()
            .map(|call| (call.id, call.function.name))
            .collect();
        assert_eq!(
            executed,
            vec![
                ("xml_call_1".to_string(), "f".to_string()),
                ("xml_call_2".to_string(), "g".to_string()),
            ]
        );

        let (_, result) = orch.finish();
        assert_eq!(result.content, "a b c");
        assert_eq!(result.tool_calls.len(), 2);
    }

    #[test]
    fn xml_recovery_can_be_disabled() {
        let config = OrchestratorConfig::default().xml_recovery(false);
        let mut orch = Orchestrator::with_config(config).expect("config");
        let text = "<tool_calls>[{\"function\":{\"name\":\"f\"}}]</tool_calls>";
        let events = orch.feed(delta(text).as_bytes());
        assert_eq!(chunks(&events), text);
        assert!(orch.finish().1.tool_calls.is_empty());
    }

    #[test]
    fn reasoning_is_accumulated_separately() {
        let mut orch = Orchestrator::new();
        orch.feed(frame(json!({"type":"delta","reasoning":"think "})).as_bytes());
        orch.feed(frame(json!({"type":"delta","reasoning":"<tool_calls>[]</tool_calls>"})).as_bytes());
        let (_, result) = orch.finish();
        assert_eq!(result.reasoning, "think <tool_calls>[]</tool_calls>");
        assert!(result.content.is_empty());
    }

    #[test]
    fn round_complete_after_tool_execution_does_not_repeat_notifications() {
        let mut orch = Orchestrator::new();
        orch.feed(
            frame(json!({"type":"delta","tool_calls":[{"id":"c1","type":"function","function":{"name":"f","arguments":"{\"a\":"}}]}))
                .as_bytes(),
        );
        orch.feed(
            frame(json!({"type":"delta","tool_calls":[{"id":"c1","function":{"arguments":"1}"}}]}))
                .as_bytes(),
        );
        let first = orch.feed(frame(json!({"type":"tool_execution","toolCount":1})).as_bytes());
        assert!(first.iter().any(|e| matches!(e, StreamEvent::ToolCalls { source: SOURCE_STREAM, .. })));

        let second = orch.feed(
            frame(json!({
                "type":"assistant_round_complete",
                "finishReason":"tool_calls",
                "tool_calls":[{"id":"c1","type":"function","function":{"name":"f","arguments":"{\"a\":1}"}}]
            }))
            .as_bytes(),
        );
        assert!(second.is_empty());

        let (_, result) = orch.finish();
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].function.arguments, "{\"a\":1}");
        let executions = result
            .timeline
            .items
            .iter()
            .filter(|item| matches!(item, TimelineItem::ToolExecution { .. }))
            .count();
        assert_eq!(executions, 1);
        assert_eq!(result.timeline.items[0].round(), 0);
    }

    #[test]
    fn round_complete_announces_unseen_batch_calls() {
        let mut orch = Orchestrator::new();
        let events = orch.feed(
            frame(json!({
                "type":"assistant_round_complete",
                "tool_calls":[
                    {"id":"a","type":"function","function":{"name":"f","arguments":"{}"}},
                    {"id":"a","type":"function","function":{"name":"f","arguments":"{}"}},
                    {"id":"b","type":"function","function":{"name":"g","arguments":"{}"}}
                ]
            }))
            .as_bytes(),
        );
        let sources: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCalls { calls, source } => Some((calls.len(), *source)),
                _ => None,
            })
            .collect();
        assert_eq!(sources, vec![(2, SOURCE_ROUND_COMPLETE)]);
        assert!(events.iter().any(|e| matches!(e, StreamEvent::ToolExecution { count: 2, .. })));
        assert_eq!(orch.timeline_state().round, 1);
    }

    #[test]
    fn tool_result_defaults_missing_id_and_name() {
        let mut orch = Orchestrator::new();
        let events = orch.feed(frame(json!({"type":"tool_result","result":{"ok":true}})).as_bytes());
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::ToolResult { name, success: false, call_id: None, .. } if name == "unknown_tool"
        )));
        let (_, result) = orch.finish();
        assert_eq!(result.tool_results[0].tool_call_id, "call_1");
        assert_eq!(result.tool_results[0].content, "{\"ok\":true}");
    }

    #[test]
    fn reset_starts_a_fresh_session() {
        let mut orch = Orchestrator::new();
        orch.feed(delta("old").as_bytes());
        let (_, first) = orch.finish();
        orch.reset();
        assert_eq!(orch.state(), SessionState::Idle);
        assert_ne!(orch.session_id(), first.session_id);
        orch.feed(delta("new").as_bytes());
        assert_eq!(orch.finish().1.content, "new");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = Orchestrator::with_config(OrchestratorConfig::default().max_line_bytes(0))
            .expect_err("zero bound");
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[tokio::test]
    async fn process_stream_reports_every_event_to_the_observer() {
        let mut orch = Orchestrator::new();
        let mut events: Vec<StreamEvent> = Vec::new();
        let body = format!("{}{}", delta("Hi"), frame(json!({"type":"done","rounds":1})));
        let (a, b) = body.split_at(7);
        let result = orch
            .process_stream(reader(vec![a.to_string(), b.to_string()]), &mut events)
            .await;
        assert!(result.success);
        assert_eq!(result.content, "Hi");
        assert_eq!(events.first(), Some(&StreamEvent::StreamStarted));
        assert!(matches!(events.last(), Some(StreamEvent::Completed(_))));
    }

    #[tokio::test]
    async fn reader_error_becomes_transport_failure() {
        let mut orch = Orchestrator::new();
        let mut events: Vec<StreamEvent> = Vec::new();
        let parts: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(delta("so far").into_bytes()),
            Err(std::io::Error::other("connection reset")),
            Ok(delta("never").into_bytes()),
        ];
        let result = orch.process_stream(futures::stream::iter(parts), &mut events).await;
        assert!(!result.success);
        assert_eq!(result.content, "so far");
        let err = result.error.expect("error");
        assert_eq!(err.kind, FailureKind::Transport);
        assert_eq!(err.error_code.as_deref(), Some("stream_error"));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Completed(_))));
    }

    #[tokio::test]
    async fn unsendable_request_is_a_transport_error() {
        let mut orch = Orchestrator::new();
        let mut events: Vec<StreamEvent> = Vec::new();
        let request = reqwest::Client::new().get("not a url");
        let err = orch
            .process_request(request, &mut events)
            .await
            .expect_err("invalid url");
        assert!(matches!(err, OrchestratorError::Transport(msg) if msg.starts_with("request failed")));
        assert!(events.is_empty());
        assert_eq!(orch.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn process_stream_resets_a_used_orchestrator() {
        let mut orch = Orchestrator::new();
        let first = orch.process_stream(reader(vec![delta("one")]), &mut ()).await;
        let second = orch.process_stream(reader(vec![delta("two")]), &mut ()).await;
        assert_eq!(second.content, "two");
        assert_ne!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn aborting_ends_the_session_normally() {
        let mut orch = Orchestrator::new();
        let abort = AbortHandle::new();
        abort.abort();
        let mut events: Vec<StreamEvent> = Vec::new();
        let result = orch
            .process_stream_abortable(futures::stream::pending::<Result<Vec<u8>, std::io::Error>>(), &mut events, &abort)
            .await;
        assert!(result.success);
        assert!(events.contains(&StreamEvent::StreamEnded));
    }

    #[tokio::test]
    async fn spawned_stream_delivers_events_and_result() {
        let body = vec![delta("a"), delta("b")];
        let mut handle = spawn_stream(Orchestrator::new(), reader(body));
        assert_eq!(handle.next_event().await, Some(StreamEvent::StreamStarted));
        let result = handle.finish().await.expect("result");
        assert!(result.success);
        assert_eq!(result.content, "ab");
    }

    #[tokio::test]
    async fn spawned_stream_can_be_aborted() {
        let (tx, rx) = mpsc::unbounded_channel::<Result<Vec<u8>, std::io::Error>>();
        tx.send(Ok(delta("before abort").into_bytes())).expect("send");
        let reader = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let mut handle = spawn_stream(Orchestrator::new(), reader);
        loop {
            match handle.next_event().await {
                Some(StreamEvent::Chunk(_)) => break,
                Some(_) => {}
                None => panic!("stream closed before first chunk"),
            }
        }
        handle.abort_handle().abort();
        let result = handle.finish().await.expect("result");
        assert!(result.success);
        assert_eq!(result.content, "before abort");
        drop(tx);
    }
}
