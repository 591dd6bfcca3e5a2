//! Chat backend contract.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::prompt::{Message, ToolCall, ToolDef};
use crate::LlmError;

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Cancelled,
    Error,
}

/// A generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl GenerateRequest {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
            tools: Vec::new(),
            max_tokens: 512,
            temperature: 0.7,
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Streaming events from the backend.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text token (or token batch).
    Delta(String),
    /// The model requested tool invocations; emitted once, complete.
    ToolCalls(Vec<ToolCall>),
    /// Terminal event.
    Done(FinishReason),
}

/// Fire-and-forget cancellation for an in-flight request.
///
/// Cancelling is idempotent; the streaming task observes the flag between
/// chunks and stops with [`FinishReason::Cancelled`].
#[derive(Clone)]
pub struct Cancellation {
    tx: watch::Sender<bool>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// A chat-completions backend with streaming and tool use.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Stream a response. Events arrive on the returned channel; the
    /// stream always terminates with [`StreamEvent::Done`].
    async fn generate_stream(
        &self,
        request: GenerateRequest,
        cancellation: Cancellation,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, LlmError>>, LlmError>;

    /// Whether the backend answers at all (readiness probe).
    async fn is_available(&self) -> bool;

    fn model_name(&self) -> &str;

    /// Rough token estimate, grapheme-aware for Indic scripts.
    fn estimate_tokens(&self, text: &str) -> usize {
        use unicode_segmentation::UnicodeSegmentation;

        let graphemes = text.graphemes(true).count();
        let indic = text
            .chars()
            .filter(|c| ('\u{0900}'..='\u{0DFF}').contains(c))
            .count();
        if indic > graphemes / 3 {
            graphemes.max(1) / 2
        } else {
            graphemes.max(1) / 4
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_idempotent() {
        let cancellation = Cancellation::new();
        assert!(!cancellation.is_cancelled());
        cancellation.cancel();
        cancellation.cancel();
        assert!(cancellation.is_cancelled());
    }

    #[test]
    fn request_builder_accumulates() {
        let request = GenerateRequest::new("be brief")
            .with_message(Message::user("hello"))
            .with_max_tokens(64)
            .with_temperature(0.2);
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.max_tokens, 64);
    }
}
