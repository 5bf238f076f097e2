use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool_calls::ToolCall;

/// One entry of the replayable session record. `timestamp` is milliseconds
/// since the session started.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineItem {
    Text {
        content: String,
        round: u32,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    ToolExecution {
        tool_calls: Vec<ToolCall>,
        tool_count: usize,
        round: u32,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: serde_json::Value,
        success: bool,
        round: u32,
        timestamp: u64,
    },
}

impl TimelineItem {
    pub fn round(&self) -> u32 {
        match self {
            Self::Text { round, .. }
            | Self::ToolExecution { round, .. }
            | Self::ToolResult { round, .. } => *round,
        }
    }
}

/// Snapshot of a session timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTimeline {
    pub items: Vec<TimelineItem>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Counters used in log lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimelineState {
    pub item_count: usize,
    pub round: u32,
    pub elapsed_ms: u64,
}

/// Records text, tool executions and tool results in arrival order.
///
/// Consecutive text of one round merges into a single item. A tool call id
/// appears in at most one `ToolExecution` item for the whole session.
#[derive(Debug)]
pub struct TimelineRecorder {
    items: Vec<TimelineItem>,
    round: u32,
    executed: HashSet<String>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Default for TimelineRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelineRecorder {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            round: 0,
            executed: HashSet::new(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn add_text(&mut self, content: &str) {
        if content.is_empty() {
            return;
        }
        if let Some(TimelineItem::Text {
            content: existing,
            round,
            ..
        }) = self.items.last_mut()
            && *round == self.round
        {
            existing.push_str(content);
            return;
        }
        let timestamp = self.elapsed_ms();
        self.items.push(TimelineItem::Text {
            content: content.to_string(),
            round: self.round,
            timestamp,
        });
    }

    /// Records a batch of executed calls, skipping ids recorded earlier.
    ///
    /// `tool_count` falls back to the number of recorded calls when absent
    /// or zero. Returns `false` when nothing new was recorded.
    pub fn add_tool_execution(&mut self, calls: &[ToolCall], tool_count: Option<usize>) -> bool {
        let mut fresh = Vec::with_capacity(calls.len());
        for call in calls {
            if self.executed.insert(call.id.clone()) {
                fresh.push(call.clone());
            }
        }
        if fresh.is_empty() {
            return false;
        }
        let tool_count = tool_count.filter(|n| *n > 0).unwrap_or(fresh.len());
        let timestamp = self.elapsed_ms();
        self.items.push(TimelineItem::ToolExecution {
            tool_calls: fresh,
            tool_count,
            round: self.round,
            timestamp,
        });
        true
    }

    /// Always appends; duplicate results are kept for audit.
    pub fn add_tool_result(
        &mut self,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: serde_json::Value,
        success: bool,
    ) {
        let timestamp = self.elapsed_ms();
        self.items.push(TimelineItem::ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            result,
            success,
            round: self.round,
            timestamp,
        });
    }

    pub fn increment_round(&mut self) {
        self.round += 1;
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn items(&self) -> &[TimelineItem] {
        &self.items
    }

    pub fn state(&self) -> TimelineState {
        TimelineState {
            item_count: self.items.len(),
            round: self.round,
            elapsed_ms: self.elapsed_ms(),
        }
    }

    /// Snapshot of the record so far. `completed_at` is left for the caller.
    pub fn timeline(&self) -> StreamTimeline {
        StreamTimeline {
            items: self.items.clone(),
            started_at: self.started_at,
            completed_at: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
