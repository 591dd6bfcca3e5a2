//! Webhook integration plugin.
//!
//! Posts the call context as JSON to a configured URL. Config:
//!
//! ```json
//! {"url": "https://...", "headers": {"x-api-key": "..."},
//!  "include_transcript": true}
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::context::CallContext;
use crate::plugin::IntegrationPlugin;
use crate::IntegrationError;

/// Outgoing webhook plugin.
pub struct WebhookPlugin {
    client: Client,
}

impl WebhookPlugin {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    fn url_from(config: &Value) -> Result<&str, IntegrationError> {
        config
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
            .ok_or_else(|| IntegrationError::InvalidConfig("url is required".to_string()))
    }
}

impl Default for WebhookPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IntegrationPlugin for WebhookPlugin {
    fn id(&self) -> &'static str {
        "webhook"
    }

    fn config_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": {"type": "string", "format": "uri"},
                "headers": {
                    "type": "object",
                    "additionalProperties": {"type": "string"}
                },
                "include_transcript": {"type": "boolean", "default": true}
            }
        })
    }

    async fn execute(
        &self,
        context: &CallContext,
        config: &Value,
    ) -> Result<Value, IntegrationError> {
        let url = Self::url_from(config)?;
        let include_transcript = config
            .get("include_transcript")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let mut payload = json!({
            "event": "call_ended",
            "session_id": context.session_id,
            "agent_id": context.agent_id,
            "organization_id": context.organization_id,
            "call_type": context.call_type,
            "started_at": context.started_at,
            "ended_at": context.ended_at,
            "duration_seconds": context.duration_seconds(),
            "extracted_data": context.extracted_data,
            "function_calls": context.function_calls,
        });
        if include_transcript {
            payload["transcript"] = serde_json::to_value(&context.transcript)
                .map_err(|e| IntegrationError::ExecutionFailed(e.to_string()))?;
        }

        let mut request = self.client.post(url).json(&payload);
        if let Some(Value::Object(headers)) = config.get("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| IntegrationError::ConnectionFailed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(json!({"status": status.as_u16()}))
        } else if status.is_server_error() || status.as_u16() == 429 {
            Err(IntegrationError::ConnectionFailed(format!(
                "webhook answered {status}"
            )))
        } else {
            Err(IntegrationError::ExecutionFailed(format!(
                "webhook answered {status}"
            )))
        }
    }

    async fn test_connection(&self, config: &Value) -> Result<(), IntegrationError> {
        let url = Self::url_from(config)?;
        self.client
            .head(url)
            .send()
            .await
            .map_err(|e| IntegrationError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }
}
