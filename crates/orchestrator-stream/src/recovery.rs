//! Recovery of tool calls that a provider wrote into the text channel as
//! `<tool_calls>[...]</tool_calls>` instead of structured deltas.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::ParseError;
use crate::tool_calls::ToolCall;

static BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<tool_calls>(.*?)</tool_calls>").expect("tool_calls block pattern is valid")
});

static BLANK_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*(?:\n[ \t]*)+\n").expect("blank-run pattern is valid"));

/// Text with the first tool-call block removed, plus the calls it held.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extraction {
    pub clean_text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Extracts XML-wrapped tool calls from text content.
///
/// The wrapped format carries no call ids, so each recovered call gets
/// `xml_call_<n>` from a counter that only restarts on [`reset`](Self::reset).
#[derive(Debug, Default)]
pub struct MalformedToolCallRecovery {
    next_id: u64,
}

impl MalformedToolCallRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `text` holds a complete `<tool_calls>` block.
    pub fn detect(text: &str) -> bool {
        BLOCK.is_match(text)
    }

    /// Removes the first block from `text` and parses the calls inside it.
    ///
    /// Never fails: an unusable block is still stripped and yields no calls.
    pub fn extract(&mut self, text: &str) -> Extraction {
        let Some(captures) = BLOCK.captures(text) else {
            return Extraction {
                clean_text: text.to_string(),
                tool_calls: Vec::new(),
            };
        };
        let (Some(block), Some(inner)) = (captures.get(0), captures.get(1)) else {
            return Extraction {
                clean_text: text.to_string(),
                tool_calls: Vec::new(),
            };
        };

        let clean_text = strip_block(text, block.start(), block.end());
        let tool_calls = match self.parse_block(inner.as_str()) {
            Ok(calls) => calls,
            Err(err) => {
                warn!(error = %err, "discarding unusable tool_calls block");
                Vec::new()
            }
        };
        info!(
            recovered = tool_calls.len(),
            removed_bytes = text.len().saturating_sub(clean_text.len()),
            "recovered tool calls embedded in text"
        );
        Extraction {
            clean_text,
            tool_calls,
        }
    }

    pub fn reset(&mut self) {
        self.next_id = 0;
    }

    fn parse_block(&mut self, inner: &str) -> Result<Vec<ToolCall>, ParseError> {
        let items: Vec<Value> =
            serde_json::from_str(inner.trim()).map_err(ParseError::malformed_tool_call)?;
        let mut calls = Vec::with_capacity(items.len());
        for (position, item) in items.iter().enumerate() {
            let function = item.get("function");
            let Some(name) = function
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
            else {
                let err = ParseError::malformed_tool_call(format!(
                    "element {position} has no function.name"
                ));
                warn!(error = %err, "skipping recovered tool call");
                continue;
            };
            let arguments = match function.and_then(|f| f.get("arguments")) {
                None | Some(Value::Null) => "{}".to_string(),
                Some(Value::String(raw)) => raw.clone(),
                Some(other) => other.to_string(),
            };
            calls.push(ToolCall::function(self.synthesize_id(), name, arguments));
        }
        Ok(calls)
    }

    fn synthesize_id(&mut self) -> String {
        self.next_id += 1;
        format!("xml_call_{}", self.next_id)
    }
}

fn strip_block(text: &str, start: usize, end: usize) -> String {
    let before = &text[..start];
    let after = &text[end..];
    let left = before.trim_end();
    let right = after.trim_start();
    let gap_had_newline =
        before[left.len()..].contains('\n') || after[..after.len() - right.len()].contains('\n');

    let separator = if left.is_empty() || right.is_empty() {
        ""
    } else if gap_had_newline {
        "\n\n"
    } else {
        " "
    };
    let joined = format!("{left}{separator}{right}");
    BLANK_RUNS.replace_all(&joined, "\n\n").trim().to_string()
}
