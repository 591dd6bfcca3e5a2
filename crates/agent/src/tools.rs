//! Agent tools.
//!
//! Tools the LLM can call during `thinking`. Each invocation is recorded
//! as a `function_call`/`function_result` transcript pair by the session.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use callbridge_llm::ToolDef;
use callbridge_rag::{KnowledgeRetriever, SearchOptions};

use crate::AgentError;

/// Ambient call information handed to tools.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub agent_id: String,
    pub organization_id: String,
}

/// A tool callable from the LLM.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn definition(&self) -> ToolDef;

    async fn invoke(&self, context: &ToolContext, arguments: Value)
        -> Result<Value, AgentError>;
}

/// Named tool collection for a session.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, tool: Arc<dyn AgentTool>) -> Self {
        self.tools.insert(tool.definition().name.clone(), tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDef> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Searches the agent's knowledge namespace.
pub struct KnowledgeSearchTool {
    retriever: Arc<KnowledgeRetriever>,
}

impl KnowledgeSearchTool {
    pub fn new(retriever: Arc<KnowledgeRetriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl AgentTool for KnowledgeSearchTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "search_knowledge".to_string(),
            description: "Search the agent's knowledge base for facts relevant to the \
                          caller's question. Use for product, pricing and policy questions."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["query"],
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The caller's question, rephrased for search"
                    },
                    "top_k": {"type": "integer", "minimum": 1, "maximum": 10}
                }
            }),
        }
    }

    async fn invoke(
        &self,
        context: &ToolContext,
        arguments: Value,
    ) -> Result<Value, AgentError> {
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::Tool("search_knowledge requires a query".to_string()))?;
        let top_k = arguments
            .get("top_k")
            .and_then(Value::as_u64)
            .map(|k| k as usize);

        let response = self
            .retriever
            .search(
                &context.agent_id,
                query,
                SearchOptions {
                    top_k,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| AgentError::Tool(e.to_string()))?;

        Ok(json!({
            "results": response.items,
            "cached": response.cached,
        }))
    }
}

/// Lets the model end the call politely.
pub struct EndCallTool {
    end_tx: watch::Sender<bool>,
}

impl EndCallTool {
    /// Returns the tool and a receiver flipped to `true` when the model
    /// asks to hang up.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (end_tx, end_rx) = watch::channel(false);
        (Self { end_tx }, end_rx)
    }
}

#[async_trait]
impl AgentTool for EndCallTool {
    fn definition(&self) -> ToolDef {
        ToolDef {
            name: "end_call".to_string(),
            description: "End the call when the conversation is finished or the caller asks \
                          to hang up. Say your farewell first."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string"}
                }
            }),
        }
    }

    async fn invoke(
        &self,
        _context: &ToolContext,
        arguments: Value,
    ) -> Result<Value, AgentError> {
        let _ = self.end_tx.send(true);
        Ok(json!({
            "ending": true,
            "reason": arguments.get("reason").cloned().unwrap_or(Value::Null),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn end_call_tool_flips_the_flag() {
        let (tool, rx) = EndCallTool::new();
        assert!(!*rx.borrow());
        tool.invoke(
            &ToolContext {
                session_id: "s1".into(),
                agent_id: "a1".into(),
                organization_id: "o1".into(),
            },
            json!({"reason": "caller said goodbye"}),
        )
        .await
        .unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn registry_returns_definitions() {
        let (end_call, _rx) = EndCallTool::new();
        let registry = ToolRegistry::new().register(Arc::new(end_call));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "end_call");
        assert!(registry.get("end_call").is_some());
        assert!(registry.get("missing").is_none());
    }
}
