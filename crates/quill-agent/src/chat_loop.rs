//! Bounded tool-calling loop that drives one user turn to completion.
//!
//! A turn is a sequence of streaming calls: each round the model either
//! answers in text (turn over) or requests tool calls, which are executed
//! and fed back as tool messages before the next round. The number of
//! rounds is capped; on the last permitted round the request forbids tools
//! so the model is pushed to produce a final answer.

use std::sync::Arc;
use std::time::Instant;

use quill_core::{
    AgentConfig, CancelToken, ChatMessage, ChatRequest, LlmConfig, Result, StreamCallback,
    StreamChunk, TokenUsage, ToolChoice, ToolDefinition, ToolExecutor, ToolRegistry,
};
use quill_llm::LlmClient;
use quill_observe::Observer;

use crate::session::ChatSession;

/// A tool source usable by the loop: it both advertises definitions and
/// executes calls.
pub trait ToolHost: ToolRegistry + ToolExecutor {}

impl<T: ToolRegistry + ToolExecutor> ToolHost for T {}

/// One executed tool call, for the turn record.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub arguments: String,
    pub success: bool,
    pub duration_ms: u64,
}

/// What a completed turn produced, beyond the messages already appended to
/// the session.
#[derive(Debug, Clone, Default)]
pub struct ChatTurnResult {
    pub content: String,
    pub reasoning: String,
    pub finish_reason: String,
    pub usage: TokenUsage,
    pub iterations: usize,
    pub tool_calls_made: Vec<ToolCallRecord>,
    pub cancelled: bool,
}

pub struct ChatLoop {
    llm: Arc<dyn LlmClient>,
    tools: Option<Arc<dyn ToolHost + Send + Sync>>,
    llm_cfg: LlmConfig,
    agent_cfg: AgentConfig,
    observer: Option<Arc<Observer>>,
}

impl ChatLoop {
    pub fn new(llm: Arc<dyn LlmClient>, llm_cfg: LlmConfig, agent_cfg: AgentConfig) -> Self {
        Self {
            llm,
            tools: None,
            llm_cfg,
            agent_cfg,
            observer: None,
        }
    }

    pub fn with_tool_host(mut self, tools: Arc<dyn ToolHost + Send + Sync>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_observer(mut self, observer: Arc<Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Advertised definitions for this turn. A failing tool host degrades
    /// to a plain chat turn rather than blocking the conversation.
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let Some(host) = &self.tools else {
            return Vec::new();
        };
        match host.list_available_tools() {
            Ok(defs) => defs,
            Err(err) => {
                self.warn(&format!("tool listing failed, continuing without tools: {err}"));
                Vec::new()
            }
        }
    }

    /// Run one user turn. The user message must already be in the session.
    /// Emits exactly one `Done` chunk when the turn is over, whatever path
    /// ended it.
    pub fn run_turn(
        &self,
        session: &mut ChatSession,
        callback: StreamCallback,
        cancel: &CancelToken,
    ) -> Result<ChatTurnResult> {
        let tools = self.tool_definitions();
        let max_iterations = self.agent_cfg.max_iterations.max(1);

        let mut result = ChatTurnResult::default();
        loop {
            result.iterations += 1;
            let final_iteration = result.iterations >= max_iterations;
            let tool_choice = if tools.is_empty() || final_iteration {
                ToolChoice::None
            } else {
                ToolChoice::Auto
            };
            let request = ChatRequest {
                model: self.llm_cfg.model.clone(),
                messages: session.messages.clone(),
                tools: tools.clone(),
                tool_choice,
                temperature: Some(self.llm_cfg.temperature),
            };

            let outcome = self
                .llm
                .stream_chat_completion(&request, callback.clone(), cancel)?;
            if let Some(usage) = &outcome.usage {
                result.usage.accumulate(usage);
            }
            result.content.push_str(&outcome.content);
            result.reasoning.push_str(&outcome.reasoning);

            let content = non_empty(outcome.content);
            let reasoning = non_empty(outcome.reasoning);
            // A round that produced nothing at all (a cancel before any
            // delta arrived) leaves no message behind.
            if content.is_some() || reasoning.is_some() || !outcome.tool_calls.is_empty() {
                session.push(ChatMessage::Assistant {
                    content,
                    reasoning,
                    tool_calls: outcome.tool_calls.clone(),
                });
            }

            if outcome.cancelled {
                result.finish_reason = "cancelled".to_owned();
                result.cancelled = true;
                callback(StreamChunk::Done { reason: None });
                return Ok(result);
            }
            if outcome.tool_calls.is_empty() {
                result.finish_reason = outcome.finish_reason;
                callback(StreamChunk::Done { reason: None });
                return Ok(result);
            }

            self.execute_batch(session, &outcome.tool_calls, &callback, &mut result);

            // The final round already requested no tools; if the backend
            // returned some anyway their results are in history, but the
            // turn stops here.
            if final_iteration {
                result.finish_reason = "max_iterations".to_owned();
                self.warn(&format!(
                    "stopping turn after {} tool-call rounds",
                    result.iterations
                ));
                callback(StreamChunk::Done {
                    reason: Some("max iterations reached".to_owned()),
                });
                return Ok(result);
            }
        }
    }

    /// Execute one batch of sibling calls and append a tool message per
    /// call, keeping history consistent even when individual calls fail.
    fn execute_batch(
        &self,
        session: &mut ChatSession,
        calls: &[quill_core::ToolCallRequest],
        callback: &StreamCallback,
        result: &mut ChatTurnResult,
    ) {
        let Some(host) = &self.tools else {
            // No executor but the model asked for tools anyway; answer each
            // call with an error result so the next round can recover.
            for call in calls {
                let failure =
                    quill_core::ToolResult::error(call, "no tool host is configured");
                session.push(tool_message(&failure));
                session.record_tool_result(failure);
            }
            return;
        };

        for call in calls {
            callback(StreamChunk::ToolCallStart {
                tool_name: call.function.name.clone(),
                args_summary: summarize_arguments(&call.function.arguments),
            });
        }

        let started = Instant::now();
        let results = host.execute_tool_calls(calls);
        let duration_ms = started.elapsed().as_millis() as u64;

        for (call, tool_result) in calls.iter().zip(results) {
            callback(StreamChunk::ToolCallEnd {
                tool_name: call.function.name.clone(),
                duration_ms,
                success: !tool_result.is_error,
            });
            result.tool_calls_made.push(ToolCallRecord {
                tool_name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
                success: !tool_result.is_error,
                duration_ms,
            });
            session.push(tool_message(&tool_result));
            session.record_tool_result(tool_result);
        }
    }

    fn warn(&self, msg: &str) {
        if let Some(observer) = &self.observer {
            observer.warn_log(msg);
        }
    }
}

fn tool_message(result: &quill_core::ToolResult) -> ChatMessage {
    ChatMessage::Tool {
        tool_call_id: result.tool_call_id.clone(),
        name: result.name.clone(),
        content: result.model_facing_content(),
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// Short single-line preview of a JSON arguments string for progress
/// display.
fn summarize_arguments(arguments: &str) -> String {
    let flat: String = arguments.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= 80 {
        flat
    } else {
        let cut: String = flat.chars().take(77).collect();
        format!("{cut}...")
    }
}
