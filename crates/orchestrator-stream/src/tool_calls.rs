use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Partial tool call as it arrives in a `delta` event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ToolCallFragment {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionFragment>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FunctionFragment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

impl ToolCallFragment {
    fn name(&self) -> Option<&str> {
        self.function.as_ref().and_then(|f| f.name.as_deref())
    }

    fn arguments(&self) -> Option<&str> {
        self.function.as_ref().and_then(|f| f.arguments.as_deref())
    }

    /// Resolves a fragment that is known to be complete (round batches).
    pub fn into_call(self) -> Option<ToolCall> {
        let id = self.id?;
        let function = self.function.unwrap_or_default();
        Some(ToolCall::function(
            id,
            function.name.unwrap_or_default(),
            function.arguments.unwrap_or_default(),
        ))
    }
}

/// A resolved tool call. `arguments` is the JSON-encoded argument object.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    /// Creates a `function` tool call.
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Assembles streamed tool-call fragments, keyed by call id.
///
/// Calls live in an arena owned by the accumulator and are handed out as
/// clones. Display and execution notifications are tracked independently:
/// some providers run tools server-side and only announce them at round end,
/// so a call may be displayed long before (or after) it is executed.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: Vec<ToolCall>,
    index: HashMap<String, usize>,
    round: HashSet<String>,
    displayed: HashSet<String>,
    executed: HashSet<String>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one streamed fragment into the accumulated call.
    ///
    /// The first fragment of an id in the current round opens the entry;
    /// later fragments overwrite the name when they carry one and append
    /// their arguments. Returns `false` when the fragment has no id.
    pub fn add_fragment(&mut self, fragment: &ToolCallFragment) -> bool {
        let Some(id) = fragment.id.as_deref().filter(|id| !id.is_empty()) else {
            warn!("dropping tool call fragment without id");
            return false;
        };

        if self.round.contains(id) {
            let slot = self.index[id];
            let call = &mut self.calls[slot];
            if let Some(name) = fragment.name().filter(|n| !n.is_empty()) {
                call.function.name = name.to_string();
            }
            if let Some(arguments) = fragment.arguments() {
                call.function.arguments.push_str(arguments);
            }
            return true;
        }

        let call = ToolCall::function(
            id,
            fragment.name().unwrap_or_default(),
            fragment.arguments().unwrap_or_default(),
        );
        debug!(tool_call_id = id, name = %call.function.name, "tool call opened");
        self.open(call);
        true
    }

    /// Records a call that arrived complete (round batch or recovered block).
    ///
    /// Arguments already streamed for the id are kept as they are.
    pub fn add_complete(&mut self, call: ToolCall) {
        match self.index.get(&call.id).copied() {
            Some(slot) => {
                let existing = &mut self.calls[slot];
                if !call.function.name.is_empty() {
                    existing.function.name = call.function.name;
                }
                if existing.function.arguments.is_empty() {
                    existing.function.arguments = call.function.arguments;
                }
                self.round.insert(call.id);
            }
            None => self.open(call),
        }
    }

    fn open(&mut self, call: ToolCall) {
        self.round.insert(call.id.clone());
        match self.index.get(&call.id).copied() {
            // Id reused from an earlier round: the new round starts it over.
            Some(slot) => self.calls[slot] = call,
            None => {
                self.index.insert(call.id.clone(), self.calls.len());
                self.calls.push(call);
            }
        }
    }

    /// Calls not yet shown to the user, in first-seen order.
    pub fn pending_for_display(&self) -> Vec<ToolCall> {
        self.pending(&self.displayed)
    }

    /// Calls not yet announced for execution, in first-seen order.
    pub fn pending_for_execution(&self) -> Vec<ToolCall> {
        self.pending(&self.executed)
    }

    fn pending(&self, notified: &HashSet<String>) -> Vec<ToolCall> {
        self.calls
            .iter()
            .filter(|call| !notified.contains(&call.id))
            .cloned()
            .collect()
    }

    pub fn mark_displayed<I>(&mut self, ids: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.displayed
            .extend(ids.into_iter().map(|id| id.as_ref().to_string()));
    }

    pub fn mark_executed<I>(&mut self, ids: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.executed
            .extend(ids.into_iter().map(|id| id.as_ref().to_string()));
    }

    pub fn is_executed(&self, id: &str) -> bool {
        self.executed.contains(id)
    }

    pub fn is_displayed(&self, id: &str) -> bool {
        self.displayed.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<&ToolCall> {
        self.index.get(id).map(|&slot| &self.calls[slot])
    }

    /// Every call seen this session, in first-seen order.
    pub fn all(&self) -> Vec<ToolCall> {
        self.calls.clone()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Forgets which ids belong to the current round. Calls and notification
    /// state survive.
    pub fn clear_round(&mut self) {
        self.round.clear();
    }

    pub fn reset(&mut self) {
        self.calls.clear();
        self.index.clear();
        self.round.clear();
        self.displayed.clear();
        self.executed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(id: &str, name: Option<&str>, arguments: Option<&str>) -> ToolCallFragment {
        ToolCallFragment {
            id: Some(id.to_string()),
            kind: Some("function".to_string()),
            function: Some(FunctionFragment {
                name: name.map(str::to_string),
                arguments: arguments.map(str::to_string),
            }),
        }
    }

    #[test]
    fn arguments_are_concatenated_in_receipt_order() {
        let mut acc = ToolCallAccumulator::new();
        let parts = ["{\"q", "\":", "\"rust", " lang\"", "}"];
        acc.add_fragment(&fragment("x", Some("search"), Some(parts[0])));
        for part in &parts[1..] {
            acc.add_fragment(&fragment("x", None, Some(part)));
        }
        let call = acc.get("x").expect("call");
        assert_eq!(call.function.arguments, parts.concat());
        assert_eq!(call.function.name, "search");
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn later_name_overwrites_but_empty_name_does_not() {
        let mut acc = ToolCallAccumulator::new();
        acc.add_fragment(&fragment("x", Some("a"), None));
        acc.add_fragment(&fragment("x", Some(""), Some("{}")));
        assert_eq!(acc.get("x").expect("call").function.name, "a");
        acc.add_fragment(&fragment("x", Some("b"), None));
        assert_eq!(acc.get("x").expect("call").function.name, "b");
    }

    #[test]
    fn fragment_without_id_is_dropped() {
        let mut acc = ToolCallAccumulator::new();
        assert!(!acc.add_fragment(&ToolCallFragment::default()));
        assert!(acc.is_empty());
    }

    #[test]
    fn display_and_execution_tracks_are_independent() {
        let mut acc = ToolCallAccumulator::new();
        acc.add_fragment(&fragment("a", Some("f"), Some("{}")));
        acc.add_fragment(&fragment("b", Some("g"), Some("{}")));

        acc.mark_displayed(["a", "b"]);
        assert!(acc.pending_for_display().is_empty());
        assert_eq!(acc.pending_for_execution().len(), 2);

        acc.mark_executed(["a"]);
        let pending: Vec<_> = acc.pending_for_execution().into_iter().map(|c| c.id).collect();
        assert_eq!(pending, vec!["b"]);
        assert!(acc.pending_for_display().is_empty());
    }

    #[test]
    fn marking_is_idempotent() {
        let mut acc = ToolCallAccumulator::new();
        acc.add_fragment(&fragment("a", Some("f"), None));
        acc.mark_executed(["a"]);
        acc.mark_executed(["a", "a"]);
        assert!(acc.is_executed("a"));
        assert!(acc.pending_for_execution().is_empty());
    }

    #[test]
    fn clear_round_keeps_calls_and_notifications() {
        let mut acc = ToolCallAccumulator::new();
        acc.add_fragment(&fragment("a", Some("f"), Some("{}")));
        acc.mark_displayed(["a"]);
        acc.clear_round();
        assert_eq!(acc.all().len(), 1);
        assert!(acc.is_displayed("a"));
        assert!(acc.pending_for_display().is_empty());
    }

    #[test]
    fn id_reused_in_new_round_starts_over_in_place() {
        let mut acc = ToolCallAccumulator::new();
        acc.add_fragment(&fragment("a", Some("f"), Some("{\"old\":1}")));
        acc.add_fragment(&fragment("b", Some("g"), Some("{}")));
        acc.clear_round();
        acc.add_fragment(&fragment("a", Some("f"), Some("{\"new\":")));
        acc.add_fragment(&fragment("a", None, Some("2}")));
        let ids: Vec<_> = acc.all().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(acc.get("a").expect("a").function.arguments, "{\"new\":2}");
    }

    #[test]
    fn complete_call_does_not_double_streamed_arguments() {
        let mut acc = ToolCallAccumulator::new();
        acc.add_fragment(&fragment("a", Some("f"), Some("{\"q\":")));
        acc.add_fragment(&fragment("a", None, Some("1}")));
        acc.add_complete(ToolCall::function("a", "f", "{\"q\":1}"));
        assert_eq!(acc.get("a").expect("a").function.arguments, "{\"q\":1}");

        acc.add_complete(ToolCall::function("b", "g", "{}"));
        assert_eq!(acc.len(), 2);
    }

    #[test]
    fn reset_clears_everything() {
        let mut acc = ToolCallAccumulator::new();
        acc.add_fragment(&fragment("a", Some("f"), None));
        acc.mark_displayed(["a"]);
        acc.reset();
        assert!(acc.is_empty());
        assert!(!acc.is_displayed("a"));
    }

    #[test]
    fn tool_call_serializes_with_type_field() {
        let value = serde_json::to_value(ToolCall::function("c1", "f", "{}")).expect("json");
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["name"], "f");
    }
}
