//! LLM access for the voice path.
//!
//! The [`ChatBackend`] trait is the seam the session orchestrator talks
//! to: streaming generation with tool calls and fire-and-forget
//! cancellation. The in-tree implementation speaks the OpenAI-compatible
//! chat completions protocol over SSE.

mod backend;
mod openai;
pub mod prompt;

pub use backend::{
    Cancellation, ChatBackend, FinishReason, GenerateRequest, StreamEvent,
};
pub use openai::{OpenAiBackend, OpenAiConfig};
pub use prompt::{Message, Role, ToolCall, ToolDef};

use thiserror::Error;

/// LLM errors.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
