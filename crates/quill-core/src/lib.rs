use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub type Result<T> = anyhow::Result<T>;

/// Per-workspace runtime directory for settings and logs.
pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".quill")
}

// ── Wire types ──────────────────────────────────────────────────────────

/// An inline attachment carried on a user message (sent as a data URL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub mime: String,
    pub base64_data: String,
}

/// One function invocation requested by the model.
///
/// `function.arguments` is accumulated by string concatenation across
/// streaming deltas and must not be parsed as JSON until the turn is
/// finalized (an empty accumulator finalizes to `"{}"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn default_call_type() -> String {
    "function".to_string()
}

impl ToolCallRequest {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: default_call_type(),
            function: ToolCallFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// A message in a multi-turn conversation, wire-shaped for the
/// OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// Off-channel reasoning text, when the backend returned it through
        /// the structured field or the inline-marker mechanism.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        reasoning: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<ToolCallRequest>,
    },
    /// Answers exactly one `tool_calls` entry of a prior assistant message.
    Tool {
        tool_call_id: String,
        name: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }
}

/// A tool (function) definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Tool selection policy sent with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    None,
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Request for one chat-completion call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub temperature: Option<f32>,
}

// ── Tool results ────────────────────────────────────────────────────────

/// Outcome of executing one [`ToolCallRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
    /// Rich interactive payload, when the tool produced one. The UI stores
    /// and renders this; the model only ever sees a short confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_resource: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn ok(call: &ToolCallRequest, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.function.name.clone(),
            content: content.into(),
            is_error: false,
            ui_resource: None,
        }
    }

    pub fn error(call: &ToolCallRequest, message: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.function.name.clone(),
            content: message.into(),
            is_error: true,
            ui_resource: None,
        }
    }

    /// Text fed back to the model for this result. Interactive payloads are
    /// replaced with a short confirmation so large opaque content is not
    /// re-injected into the prompt.
    pub fn model_facing_content(&self) -> String {
        if self.ui_resource.is_some() {
            format!(
                "Tool '{}' returned an interactive result; it has been displayed to the user.",
                self.name
            )
        } else {
            self.content.clone()
        }
    }
}

// ── Streaming callback surface ──────────────────────────────────────────

/// A single chunk emitted while a chat turn streams.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A visible-answer text delta.
    ContentDelta(String),
    /// An off-channel reasoning text delta.
    ReasoningDelta(String),
    /// Token accounting for the turn. Emitted before `ToolCalls`.
    Usage(TokenUsage),
    /// The fully accumulated tool calls for this turn.
    ToolCalls(Vec<ToolCallRequest>),
    /// A tool call has started execution.
    ToolCallStart {
        tool_name: String,
        args_summary: String,
    },
    /// A tool call has finished execution.
    ToolCallEnd {
        tool_name: String,
        duration_ms: u64,
        success: bool,
    },
    /// The turn is over. Carries a notice when the loop was force-stopped.
    Done { reason: Option<String> },
}

/// Callback for receiving streaming chunks.
/// `Arc<dyn Fn>` so it can be cloned across the iterations of a chat turn.
pub type StreamCallback = Arc<dyn Fn(StreamChunk) + Send + Sync>;

// ── Cancellation ────────────────────────────────────────────────────────

/// Shared cancellation flag for one chat turn.
///
/// Cancelling is idempotent: cancelling twice, or after the turn already
/// completed, is a no-op. Cancellation always resolves through the normal
/// completion path, never as an error.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Failures that abort a streaming call. Per-frame JSON problems are not
/// errors (they are logged and skipped), and cancellation is not an error.
#[derive(Debug, thiserror::Error)]
pub enum ChatStreamError {
    #[error("HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("network error: {0}")]
    Transport(String),
}

// ── Collaborator interfaces ─────────────────────────────────────────────

/// Source of tool definitions offered to the model.
pub trait ToolRegistry {
    fn list_available_tools(&self) -> Result<Vec<ToolDefinition>>;
    fn has_available_tools(&self) -> bool;
}

/// Executes tool calls requested by the model.
pub trait ToolExecutor: Send + Sync {
    fn execute_tool_call(&self, call: &ToolCallRequest) -> Result<ToolResult>;

    /// Execute a batch of sibling tool calls concurrently.
    ///
    /// Returns exactly one result per input call, in input order. A failing
    /// call yields `ToolResult { is_error: true }` — it never aborts or
    /// drops the remaining calls.
    fn execute_tool_calls(&self, calls: &[ToolCallRequest]) -> Vec<ToolResult> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = calls
                .iter()
                .map(|call| {
                    scope.spawn(move || {
                        self.execute_tool_call(call)
                            .unwrap_or_else(|err| ToolResult::error(call, err.to_string()))
                    })
                })
                .collect();
            handles
                .into_iter()
                .zip(calls)
                .map(|(handle, call)| match handle.join() {
                    Ok(result) => result,
                    Err(_) => ToolResult::error(call, "tool execution panicked"),
                })
                .collect()
        })
    }
}

// ── Configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible backend. The driver appends
    /// `/api/chat/completions`.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            api_key_env: "QUILL_API_KEY".to_string(),
            temperature: 0.7,
            timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum LLM↔tool round trips within a single user turn.
    pub max_iterations: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { max_iterations: 5 }
    }
}

/// Marker spellings and buffer limits for the tag-aware stream splitter.
///
/// The guard length is tied to the marker spellings (longest marker minus
/// one); a zero value means "compute from the configured markers".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningTagConfig {
    pub start_markers: Vec<String>,
    pub end_markers: Vec<String>,
    /// Buffered characters before giving up on marker detection.
    pub detection_threshold: usize,
    /// Trailing characters withheld from flushing while a marker may still
    /// be arriving.
    pub marker_guard: usize,
}

impl Default for ReasoningTagConfig {
    fn default() -> Self {
        Self {
            start_markers: vec!["<think>".to_string(), "<thinking>".to_string()],
            end_markers: vec!["</think>".to_string(), "</thinking>".to_string()],
            detection_threshold: 3000,
            marker_guard: 15,
        }
    }
}

impl ReasoningTagConfig {
    /// Effective guard length: configured value, or longest marker minus one.
    pub fn effective_guard(&self) -> usize {
        if self.marker_guard > 0 {
            return self.marker_guard;
        }
        self.start_markers
            .iter()
            .chain(self.end_markers.iter())
            .map(|m| m.chars().count())
            .max()
            .unwrap_or(1)
            .saturating_sub(1)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub reasoning: ReasoningTagConfig,
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".quill/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Load layered settings: defaults, legacy TOML, then user, project and
    /// project-local JSON, each overlay merged recursively.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let legacy = Self::legacy_toml_path(workspace);
        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn tool_message_serializes_with_role_and_ids() {
        let msg = ChatMessage::Tool {
            tool_call_id: "call_1".to_string(),
            name: "search".to_string(),
            content: "ok".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_1");
        assert_eq!(value["name"], "search");
    }

    #[test]
    fn assistant_message_omits_empty_tool_calls() {
        let msg = ChatMessage::Assistant {
            content: Some("hi".to_string()),
            reasoning: None,
            tool_calls: vec![],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("tool_calls").is_none());
        assert!(value.get("reasoning").is_none());
    }

    #[test]
    fn tool_call_request_round_trips_wire_shape() {
        let raw = r#"{"id":"a","type":"function","function":{"name":"f","arguments":"{}"}}"#;
        let call: ToolCallRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(call.id, "a");
        assert_eq!(call.call_type, "function");
        assert_eq!(call.function.name, "f");
        let back = serde_json::to_value(&call).unwrap();
        assert_eq!(back["type"], "function");
    }

    #[test]
    fn tool_choice_serializes_lowercase() {
        assert_eq!(serde_json::to_value(ToolChoice::Auto).unwrap(), "auto");
        assert_eq!(serde_json::to_value(ToolChoice::None).unwrap(), "none");
    }

    #[test]
    fn cancel_token_is_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn model_facing_content_substitutes_interactive_payloads() {
        let call = ToolCallRequest::function("c1", "chart", "{}");
        let mut result = ToolResult::ok(&call, "raw payload");
        assert_eq!(result.model_facing_content(), "raw payload");
        result.ui_resource = Some(serde_json::json!({"kind": "chart", "data": [1, 2, 3]}));
        let facing = result.model_facing_content();
        assert!(facing.contains("interactive result"));
        assert!(!facing.contains("raw payload"));
    }

    struct FlakyExecutor {
        calls_seen: Mutex<Vec<String>>,
    }

    impl ToolExecutor for FlakyExecutor {
        fn execute_tool_call(&self, call: &ToolCallRequest) -> Result<ToolResult> {
            self.calls_seen
                .lock()
                .unwrap()
                .push(call.function.name.clone());
            if call.function.name == "boom" {
                anyhow::bail!("tool exploded");
            }
            Ok(ToolResult::ok(call, format!("ran {}", call.function.name)))
        }
    }

    #[test]
    fn batched_execution_isolates_failures_and_preserves_order() {
        let executor = FlakyExecutor {
            calls_seen: Mutex::new(Vec::new()),
        };
        let calls = vec![
            ToolCallRequest::function("c1", "boom", "{}"),
            ToolCallRequest::function("c2", "echo", "{}"),
        ];
        let results = executor.execute_tool_calls(&calls);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_error);
        assert_eq!(results[0].tool_call_id, "c1");
        assert!(results[0].content.contains("tool exploded"));
        assert!(!results[1].is_error);
        assert_eq!(results[1].tool_call_id, "c2");
        assert_eq!(executor.calls_seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn effective_guard_computes_from_markers_when_unset() {
        let cfg = ReasoningTagConfig {
            marker_guard: 0,
            ..Default::default()
        };
        // Longest default marker is "</thinking>" (11 chars).
        assert_eq!(cfg.effective_guard(), 10);
        let cfg = ReasoningTagConfig::default();
        assert_eq!(cfg.effective_guard(), 15);
    }

    #[test]
    fn project_settings_overlay_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path();
        let custom = AppConfig {
            llm: LlmConfig {
                model: "llama-3.3-70b".to_string(),
                ..Default::default()
            },
            agent: AgentConfig { max_iterations: 3 },
            ..Default::default()
        };
        custom.save(workspace).unwrap();

        let loaded = AppConfig::load(workspace).unwrap();
        assert_eq!(loaded.llm.model, "llama-3.3-70b");
        assert_eq!(loaded.agent.max_iterations, 3);
        // Untouched sections keep their defaults.
        assert_eq!(loaded.reasoning.detection_threshold, 3000);
    }

    #[test]
    fn local_settings_win_over_project_settings() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path();
        AppConfig::default().save(workspace).unwrap();
        fs::write(
            AppConfig::project_local_settings_path(workspace),
            r#"{"llm": {"temperature": 0.1}}"#,
        )
        .unwrap();

        let loaded = AppConfig::load(workspace).unwrap();
        assert!((loaded.llm.temperature - 0.1).abs() < f32::EPSILON);
        // Partial overlays must not clobber sibling fields.
        assert_eq!(loaded.llm.api_key_env, "QUILL_API_KEY");
    }

    #[test]
    fn legacy_toml_config_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path();
        fs::create_dir_all(runtime_dir(workspace)).unwrap();
        fs::write(
            AppConfig::legacy_toml_path(workspace),
            "[llm]\nmodel = \"qwen-2.5\"\n",
        )
        .unwrap();

        let loaded = AppConfig::load(workspace).unwrap();
        assert_eq!(loaded.llm.model, "qwen-2.5");
    }
}
