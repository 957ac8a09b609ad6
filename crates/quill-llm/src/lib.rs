//! Streaming client for OpenAI-compatible chat completion backends.
//!
//! One call to [`LlmClient::stream_chat_completion`] drives a full SSE
//! response: frames are decoded, content is split into visible and
//! reasoning channels, tool-call fragments are accumulated, and the caller
//! observes progress through a [`StreamCallback`]. The aggregate result
//! comes back as a [`StreamOutcome`] when the stream ends.

pub mod accumulator;
pub mod splitter;
pub mod sse;

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use quill_core::{
    CancelToken, ChatRequest, ChatStreamError, LlmConfig, ReasoningTagConfig, Result,
    StreamCallback, StreamChunk, TokenUsage, ToolCallRequest,
};
use quill_observe::Observer;
use serde_json::{Value, json};

use crate::accumulator::ToolCallAccumulator;
use crate::splitter::{SplitEvent, TagSplitter};
use crate::sse::SseFrameReader;

const DONE_SENTINEL: &str = "[DONE]";
const COMPLETIONS_PATH: &str = "/api/chat/completions";

/// Upper bound on how long a cancel can go unnoticed while the stream is
/// idle: each body read times out after this interval so the cancel token
/// gets re-checked.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Aggregate result of one streaming call.
///
/// Completion is signalled by this value being returned; the callback only
/// ever sees deltas and turn-level events, never a per-request terminator.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: String,
    pub usage: Option<TokenUsage>,
    /// True when the turn's cancel token fired mid-stream. The outcome then
    /// holds whatever text arrived, and `tool_calls` is empty so no
    /// half-built call can reach conversation history.
    pub cancelled: bool,
    /// Frames whose JSON failed to parse and were skipped.
    pub malformed_frames: u32,
}

/// Backend abstraction so the agent loop can be driven by a scripted
/// double in tests.
pub trait LlmClient: Send + Sync {
    fn stream_chat_completion(
        &self,
        request: &ChatRequest,
        callback: StreamCallback,
        cancel: &CancelToken,
    ) -> Result<StreamOutcome>;
}

pub struct OpenAiClient {
    cfg: LlmConfig,
    reasoning_cfg: ReasoningTagConfig,
    client: reqwest::blocking::Client,
    observer: Option<Arc<Observer>>,
}

impl OpenAiClient {
    pub fn new(cfg: LlmConfig, reasoning_cfg: ReasoningTagConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .read_timeout(CANCEL_POLL_INTERVAL)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            cfg,
            reasoning_cfg,
            client,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Environment variable takes precedence over the configured key.
    fn resolve_api_key(&self) -> Result<String> {
        if let Ok(key) = std::env::var(&self.cfg.api_key_env)
            && !key.is_empty()
        {
            return Ok(key);
        }
        if let Some(key) = &self.cfg.api_key
            && !key.is_empty()
        {
            return Ok(key.clone());
        }
        Err(anyhow!(
            "no API key: set {} or llm.api_key in settings",
            self.cfg.api_key_env
        ))
    }

    fn completions_url(&self) -> String {
        format!(
            "{}{}",
            self.cfg.base_url.trim_end_matches('/'),
            COMPLETIONS_PATH
        )
    }

    fn build_payload(&self, request: &ChatRequest) -> Value {
        let mut payload = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
        });
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            payload["tools"] = serde_json::to_value(&request.tools).unwrap_or_else(|_| json!([]));
            payload["tool_choice"] =
                serde_json::to_value(request.tool_choice).unwrap_or_else(|_| json!("auto"));
        }
        payload
    }

    fn warn(&self, msg: &str) {
        if let Some(observer) = &self.observer {
            observer.warn_log(msg);
        }
    }
}

impl LlmClient for OpenAiClient {
    fn stream_chat_completion(
        &self,
        request: &ChatRequest,
        callback: StreamCallback,
        cancel: &CancelToken,
    ) -> Result<StreamOutcome> {
        let api_key = self.resolve_api_key()?;
        let payload = self.build_payload(request);
        let deadline = Instant::now() + Duration::from_secs(self.cfg.timeout_seconds);

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .map_err(|err| ChatStreamError::Transport(describe_transport_error(&err)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ChatStreamError::Api {
                status: status.as_u16(),
                message: extract_api_error(status.as_u16(), &body),
            }
            .into());
        }

        let mut session = StreamSession::new(&self.reasoning_cfg);
        let mut frames = SseFrameReader::new(response);
        loop {
            if cancel.is_cancelled() {
                return Ok(session.finish_cancelled(&callback));
            }
            let event = match frames.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(err) => {
                    // Cancellation always wins over a read failure, so a
                    // cancel during a stalled read resolves through the
                    // normal path rather than as an error.
                    if cancel.is_cancelled() {
                        return Ok(session.finish_cancelled(&callback));
                    }
                    if is_read_timeout(&err) {
                        if Instant::now() >= deadline {
                            return Err(ChatStreamError::Transport(
                                "request timed out".to_owned(),
                            )
                            .into());
                        }
                        // Idle poll window elapsed; re-check the token and
                        // keep reading. The frame reader resumes mid-line.
                        continue;
                    }
                    return Err(
                        ChatStreamError::Transport(format!("stream read failed: {err}")).into(),
                    );
                }
            };
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == DONE_SENTINEL {
                break;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(frame) => session.apply_frame(&frame, &callback),
                Err(err) => {
                    session.malformed_frames += 1;
                    self.warn(&format!("skipping malformed stream frame: {err}"));
                }
            }
        }
        Ok(session.finish_complete(&callback))
    }
}

/// Per-request decoding state: the splitter, the tool-call accumulator and
/// the aggregate buffers that become the [`StreamOutcome`].
struct StreamSession {
    splitter: TagSplitter,
    tools: ToolCallAccumulator,
    content: String,
    reasoning: String,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
    malformed_frames: u32,
}

impl StreamSession {
    fn new(reasoning_cfg: &ReasoningTagConfig) -> Self {
        Self {
            splitter: TagSplitter::new(reasoning_cfg),
            tools: ToolCallAccumulator::new(),
            content: String::new(),
            reasoning: String::new(),
            finish_reason: None,
            usage: None,
            malformed_frames: 0,
        }
    }

    fn apply_frame(&mut self, frame: &Value, callback: &StreamCallback) {
        // Usage rides on a late frame, often after finish_reason.
        if let Some(usage) = frame.get("usage")
            && !usage.is_null()
            && let Ok(parsed) = serde_json::from_value::<TokenUsage>(usage.clone())
        {
            self.usage = Some(parsed);
        }
        let Some(choice) = frame
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            return;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_owned());
        }
        let Some(delta) = choice.get("delta") else {
            return;
        };
        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            for event in self.splitter.push(content) {
                self.emit_split(event, callback);
            }
        }
        // Some backends carry reasoning in a dedicated field instead of (or
        // alongside) inline markers; both feed the same reasoning buffer.
        if let Some(reasoning) = delta.get("reasoning").and_then(Value::as_str) {
            self.reasoning.push_str(reasoning);
            callback(StreamChunk::ReasoningDelta(reasoning.to_owned()));
        }
        if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
            self.tools.apply_deltas(tool_calls);
        }
    }

    fn emit_split(&mut self, event: SplitEvent, callback: &StreamCallback) {
        match event {
            SplitEvent::Content(text) => {
                self.content.push_str(&text);
                callback(StreamChunk::ContentDelta(text));
            }
            SplitEvent::Reasoning(text) => {
                self.reasoning.push_str(&text);
                callback(StreamChunk::ReasoningDelta(text));
            }
        }
    }

    fn flush_splitter(&mut self, callback: &StreamCallback) {
        for event in self.splitter.finish() {
            self.emit_split(event, callback);
        }
    }

    fn finish_complete(mut self, callback: &StreamCallback) -> StreamOutcome {
        self.flush_splitter(callback);
        if let Some(usage) = self.usage {
            callback(StreamChunk::Usage(usage));
        }
        let tool_calls = self.tools.finalize();
        if !tool_calls.is_empty() {
            callback(StreamChunk::ToolCalls(tool_calls.clone()));
        }
        StreamOutcome {
            content: self.content,
            reasoning: self.reasoning,
            tool_calls,
            finish_reason: self.finish_reason.unwrap_or_else(|| "stop".to_owned()),
            usage: self.usage,
            cancelled: false,
            malformed_frames: self.malformed_frames,
        }
    }

    /// Buffered text is flushed so nothing the user saw is lost, but
    /// accumulated tool-call fragments are discarded: an assistant message
    /// without its tool results must never enter history.
    fn finish_cancelled(mut self, callback: &StreamCallback) -> StreamOutcome {
        self.flush_splitter(callback);
        StreamOutcome {
            content: self.content,
            reasoning: self.reasoning,
            tool_calls: Vec::new(),
            finish_reason: "cancelled".to_owned(),
            usage: self.usage,
            cancelled: true,
            malformed_frames: self.malformed_frames,
        }
    }
}

/// Whether a body-read error is the per-read poll timeout rather than a
/// real transport failure. The HTTP client surfaces its timeouts either as
/// a plain `TimedOut` io error or wrapped in its own error type.
fn is_read_timeout(err: &io::Error) -> bool {
    if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
        return true;
    }
    let mut source: Option<&(dyn std::error::Error + 'static)> =
        err.get_ref().map(|e| e as &(dyn std::error::Error + 'static));
    while let Some(inner) = source {
        if let Some(request_err) = inner.downcast_ref::<reqwest::Error>() {
            return request_err.is_timeout();
        }
        source = inner.source();
    }
    false
}

fn describe_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_owned()
    } else if err.is_connect() {
        format!("could not connect to backend: {err}")
    } else {
        err.to_string()
    }
}

/// Pull a human-readable message out of an error response body. Backends
/// usually send `{"error": {"message": ...}}` or `{"error": "..."}`; when
/// neither matches, fall back to the raw body or a bare status line.
fn extract_api_error(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
        {
            return message.to_owned();
        }
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return message.to_owned();
        }
        if let Some(message) = value.get("detail").and_then(Value::as_str) {
            return message.to_owned();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {status}")
    } else {
        trimmed.chars().take(200).collect()
    }
}
