//! Turn orchestration: conversation state plus the bounded tool-calling
//! loop that drives a user turn against a streaming backend.

pub mod chat_loop;
pub mod session;

pub use chat_loop::{ChatLoop, ChatTurnResult, ToolCallRecord, ToolHost};
pub use session::{ChatSession, RecordedToolResult};
