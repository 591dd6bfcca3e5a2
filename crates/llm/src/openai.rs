//! OpenAI-compatible chat completions backend.
//!
//! Streams `text/event-stream` chunks, reassembling incremental tool-call
//! deltas into complete [`ToolCall`]s. Transient failures on the initial
//! request are retried with exponential backoff; a stream that dies
//! mid-response is surfaced as an error event, not retried (the voice
//! path restarts the turn instead).

use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::backend::{Cancellation, ChatBackend, FinishReason, GenerateRequest, StreamEvent};
use crate::prompt::ToolCall;
use crate::LlmError;

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL ending in `/v1`.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// OpenAI-compatible backend.
#[derive(Clone)]
pub struct OpenAiBackend {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    fn request_body(&self, request: &GenerateRequest) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }

    async fn open_stream(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.config.endpoint);
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0u32;

        loop {
            let mut builder = self.client.post(&url).json(body);
            if !self.config.api_key.is_empty() {
                builder = builder.bearer_auth(&self.config.api_key);
            }

            let result = builder.send().await;
            let error = match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    LlmError::Upstream { status, body }
                }
                Err(e) if e.is_timeout() => LlmError::Timeout(self.config.timeout),
                Err(e) => LlmError::Transport(e.to_string()),
            };

            attempt += 1;
            if !error.is_transient() || attempt > self.config.max_retries {
                return Err(error);
            }
            tracing::warn!(attempt, error = %error, "LLM request failed, backing off");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
    }
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    /// Indexed fragments: id, name, argument pieces.
    entries: BTreeMap<usize, (String, String, String)>,
}

impl ToolCallAccumulator {
    fn apply(&mut self, delta: &ToolCallDelta) {
        let entry = self.entries.entry(delta.index).or_default();
        if let Some(id) = &delta.id {
            entry.0 = id.clone();
        }
        if let Some(function) = &delta.function {
            if let Some(name) = &function.name {
                entry.1.push_str(name);
            }
            if let Some(arguments) = &function.arguments {
                entry.2.push_str(arguments);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn finish(self) -> Vec<ToolCall> {
        self.entries
            .into_values()
            .map(|(id, name, arguments)| ToolCall {
                id,
                name,
                arguments,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[async_trait::async_trait]
impl ChatBackend for OpenAiBackend {
    async fn generate_stream(
        &self,
        request: GenerateRequest,
        cancellation: Cancellation,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, LlmError>>, LlmError> {
        let body = self.request_body(&request);
        let response = self.open_stream(&body).await?;
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            let mut tool_calls = ToolCallAccumulator::default();
            let mut finish = FinishReason::Stop;

            'stream: loop {
                if cancellation.is_cancelled() {
                    let _ = tx.send(Ok(StreamEvent::Done(FinishReason::Cancelled))).await;
                    return;
                }

                let chunk = match bytes.next().await {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(LlmError::Transport(e.to_string()))).await;
                        let _ = tx.send(Ok(StreamEvent::Done(FinishReason::Error))).await;
                        return;
                    }
                    None => break 'stream,
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are newline-delimited `data: {...}` lines.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload.is_empty() {
                        continue;
                    }
                    if payload == "[DONE]" {
                        break 'stream;
                    }

                    let parsed: StreamChunk = match serde_json::from_str(payload) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            tracing::debug!(error = %e, "Skipping malformed SSE chunk");
                            continue;
                        }
                    };

                    for choice in parsed.choices {
                        if let Some(content) = choice.delta.content {
                            if !content.is_empty()
                                && tx.send(Ok(StreamEvent::Delta(content))).await.is_err()
                            {
                                return;
                            }
                        }
                        if let Some(deltas) = choice.delta.tool_calls {
                            for delta in &deltas {
                                tool_calls.apply(delta);
                            }
                        }
                        if let Some(reason) = choice.finish_reason {
                            finish = match reason.as_str() {
                                "length" => FinishReason::Length,
                                "tool_calls" => FinishReason::ToolCalls,
                                _ => FinishReason::Stop,
                            };
                        }
                    }
                }
            }

            if !tool_calls.is_empty() {
                let calls = tool_calls.finish();
                finish = FinishReason::ToolCalls;
                if tx.send(Ok(StreamEvent::ToolCalls(calls))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(StreamEvent::Done(finish))).await;
        });

        Ok(rx)
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/models", self.config.endpoint);
        let mut builder = self.client.get(&url);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }
        matches!(builder.send().await, Ok(r) if r.status().is_success())
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_accumulator_reassembles_fragments() {
        let mut acc = ToolCallAccumulator::default();
        let deltas: Vec<ToolCallDelta> = vec![
            serde_json::from_str(
                r#"{"index":0,"id":"call_1","function":{"name":"search_knowledge","arguments":""}}"#,
            )
            .unwrap(),
            serde_json::from_str(r#"{"index":0,"function":{"arguments":"{\"query\":"}}"#).unwrap(),
            serde_json::from_str(r#"{"index":0,"function":{"arguments":"\"rates\"}"}}"#).unwrap(),
        ];
        for delta in &deltas {
            acc.apply(delta);
        }
        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search_knowledge");
        assert_eq!(calls[0].arguments, r#"{"query":"rates"}"#);
    }

    #[test]
    fn stream_chunk_parses() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hello"));
    }

    #[test]
    fn request_body_includes_tools() {
        let backend = OpenAiBackend::new(OpenAiConfig::default());
        let request = GenerateRequest::new("system").with_tools(vec![crate::prompt::ToolDef {
            name: "end_call".into(),
            description: "End the call".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }]);
        let body = backend.request_body(&request);
        assert_eq!(body["tools"][0]["function"]["name"], "end_call");
        assert_eq!(body["stream"], true);
    }
}
