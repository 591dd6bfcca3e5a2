//! Voice session orchestration.
//!
//! A [`session::VoiceSession`] assembles one live call: the agent profile
//! (prompt, greeting, farewell, voice, language), the STT/TTS/LLM
//! adapters, the turn controller and the latency tracker, wired together
//! as a cooperative task group over bounded channels.

pub mod session;
pub mod tools;

pub use session::{
    AgentProfile, SessionSink, SessionSummary, VoiceSession, VoiceSessionConfig,
    VoiceSessionEvent,
};
pub use tools::{AgentTool, EndCallTool, KnowledgeSearchTool, ToolContext, ToolRegistry};

use thiserror::Error;

/// Agent-layer errors.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("pipeline error: {0}")]
    Pipeline(#[from] callbridge_pipeline::PipelineError),

    #[error("llm error: {0}")]
    Llm(#[from] callbridge_llm::LlmError),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}
