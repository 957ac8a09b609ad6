//! Accumulates streamed tool-call fragments into complete requests.
//!
//! Backends deliver tool calls as a sequence of deltas: the first fragment
//! for a call usually carries its id and function name, and every fragment
//! appends a slice of the JSON arguments string. Fragments are correlated by
//! the provider-assigned `index`, not by array position within a frame.

use std::collections::BTreeMap;

use quill_core::ToolCallRequest;
use serde_json::Value;

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    call_type: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    entries: BTreeMap<u64, PartialToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge one frame's `delta.tool_calls` array. Position within the array
    /// only serves as a fallback key when a fragment omits `index`.
    pub fn apply_deltas(&mut self, deltas: &[Value]) {
        for (fallback, delta) in deltas.iter().enumerate() {
            let index = delta
                .get("index")
                .and_then(Value::as_u64)
                .unwrap_or(fallback as u64);
            let entry = self.entries.entry(index).or_default();
            if entry.id.is_empty()
                && let Some(id) = delta.get("id").and_then(Value::as_str)
                && !id.is_empty()
            {
                entry.id = id.to_owned();
            }
            if entry.call_type.is_empty()
                && let Some(kind) = delta.get("type").and_then(Value::as_str)
                && !kind.is_empty()
            {
                entry.call_type = kind.to_owned();
            }
            if let Some(function) = delta.get("function") {
                if entry.name.is_empty()
                    && let Some(name) = function.get("name").and_then(Value::as_str)
                    && !name.is_empty()
                {
                    entry.name = name.to_owned();
                }
                if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                    entry.arguments.push_str(args);
                }
            }
        }
    }

    /// Seal the accumulated fragments into complete requests, ordered by
    /// index. Missing ids get a deterministic placeholder so tool results
    /// can still be correlated; empty argument strings become `{}` so
    /// downstream JSON parsing always sees an object.
    pub fn finalize(self) -> Vec<ToolCallRequest> {
        self.entries
            .into_iter()
            .map(|(index, partial)| {
                let id = if partial.id.is_empty() {
                    format!("tool_call_{}", index + 1)
                } else {
                    partial.id
                };
                let arguments = if partial.arguments.is_empty() {
                    "{}".to_owned()
                } else {
                    partial.arguments
                };
                let mut call = ToolCallRequest::function(id, partial.name, arguments);
                if !partial.call_type.is_empty() {
                    call.call_type = partial.call_type;
                }
                call
            })
            .collect()
    }
}
