//! Conversation state for one chat session.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use quill_core::{ChatMessage, Result, ToolResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tool result together with when it was recorded, so the UI can replay
/// interactive resources in order when a session is reloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedToolResult {
    pub result: ToolResult,
    pub recorded_at: DateTime<Utc>,
}

/// Full message history plus per-call tool results, serializable for
/// persistence under the workspace runtime directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub title: Option<String>,
    pub messages: Vec<ChatMessage>,
    tool_results: BTreeMap<String, RecordedToolResult>,
}

impl ChatSession {
    pub fn new(system_prompt: Option<&str>) -> Self {
        let mut messages = Vec::new();
        if let Some(prompt) = system_prompt {
            messages.push(ChatMessage::system(prompt));
        }
        Self {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            title: None,
            messages,
            tool_results: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    /// Record (or overwrite) the result for a tool call id. Re-running a
    /// call replaces its earlier result rather than accumulating duplicates.
    pub fn record_tool_result(&mut self, result: ToolResult) {
        self.tool_results.insert(
            result.tool_call_id.clone(),
            RecordedToolResult {
                result,
                recorded_at: Utc::now(),
            },
        );
    }

    pub fn tool_result(&self, tool_call_id: &str) -> Option<&RecordedToolResult> {
        self.tool_results.get(tool_call_id)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        let session = serde_json::from_str(&json)
            .with_context(|| format!("invalid session file {}", path.display()))?;
        Ok(session)
    }
}
